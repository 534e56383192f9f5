//! Bridge adapter seam: `estimate_fee`/`send_cross_chain`.
//!
//! A thin async trait the Orchestrator drives, with a paper/simulated
//! implementation for environments with no real bridge RPC wired up yet.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, Duration};

use crate::errors::ChainError;
use crate::model::ChainId;

#[derive(Debug, Clone)]
pub struct FeeEstimateRequest {
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub amount: u128,
    pub target_protocol: String,
    pub gas_limit: u64,
}

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub token: String,
    pub amount: u128,
    pub target_pool: String,
    pub fee_native: u128,
    pub gas_limit: u64,
}

#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    async fn estimate_fee(&self, req: &FeeEstimateRequest) -> Result<u128, ChainError>;
    async fn send_cross_chain(&self, req: &SendRequest) -> Result<String, ChainError>;
}

/// Paper bridge: simulates fee quotes and a submission receipt without
/// touching a real RPC endpoint.
#[derive(Debug, Clone, Default)]
pub struct PaperBridgeAdapter {
    pub reject_prob: f64,
}

#[async_trait]
impl BridgeAdapter for PaperBridgeAdapter {
    async fn estimate_fee(&self, req: &FeeEstimateRequest) -> Result<u128, ChainError> {
        sleep(Duration::from_millis(20)).await;
        let mut rng = StdRng::from_entropy();
        if rng.gen::<f64>() < self.reject_prob {
            return Err(ChainError::retriable("fee quote service unavailable"));
        }
        // A trivial gas-proportional fee model: enough to exercise fee
        // variance accounting without any real bridge pricing feed.
        let fee = (req.gas_limit as u128) * 2 + req.amount / 10_000;
        Ok(fee)
    }

    async fn send_cross_chain(&self, req: &SendRequest) -> Result<String, ChainError> {
        sleep(Duration::from_millis(30)).await;
        let mut rng = StdRng::from_entropy();
        if rng.gen::<f64>() < self.reject_prob {
            return Err(ChainError::retriable("bridge submission rejected"));
        }
        Ok(format!(
            "msg-{}-{}-{}",
            req.source_chain,
            req.dest_chain,
            rng.gen::<u32>()
        ))
    }
}
