//! Cross-chain message model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ChainId;

/// State machine: `Created -> FeeEstimated -> Submitted -> SourceConfirmed
/// -> InFlight -> DestinationDelivered -> Finalized`, with terminal error
/// states `FeeEstimateFailed`, `SubmissionFailed`, `SourceReverted`,
/// `DeliveryTimeout`, `DestinationReverted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    Created,
    FeeEstimated,
    Submitted,
    SourceConfirmed,
    InFlight,
    DestinationDelivered,
    Finalized,
    FeeEstimateFailed,
    SubmissionFailed,
    SourceReverted,
    DeliveryTimeout,
    DestinationReverted,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageState::Finalized
                | MessageState::FeeEstimateFailed
                | MessageState::SubmissionFailed
                | MessageState::SourceReverted
                | MessageState::DeliveryTimeout
                | MessageState::DestinationReverted
        )
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            MessageState::FeeEstimateFailed
                | MessageState::SubmissionFailed
                | MessageState::SourceReverted
                | MessageState::DeliveryTimeout
                | MessageState::DestinationReverted
        )
    }

    /// Legal next states for a non-retry forward transition. Used to
    /// reject out-of-order transitions: observed states must form a
    /// prefix of a legal path, with no skips and no regressions except
    /// into a terminal error state.
    pub fn legal_next(self) -> &'static [MessageState] {
        use MessageState::*;
        match self {
            Created => &[FeeEstimated, FeeEstimateFailed],
            FeeEstimated => &[Submitted, SubmissionFailed],
            Submitted => &[SourceConfirmed, SourceReverted],
            SourceConfirmed => &[InFlight],
            InFlight => &[DestinationDelivered, DeliveryTimeout],
            DestinationDelivered => &[Finalized, DestinationReverted],
            Finalized | FeeEstimateFailed | SubmissionFailed | SourceReverted | DeliveryTimeout
            | DestinationReverted => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReceipt {
    pub realized_fee_native: u128,
    pub destination_tx_hash: String,
}

/// One bridge transfer tracked end-to-end by the Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossChainMessage {
    pub message_id: String,
    pub source_chain: ChainId,
    pub dest_chain: ChainId,
    pub token: String,
    pub amount: u128,
    pub target_pool: String,
    pub target_protocol: String,
    pub fee_native: u128,
    pub gas_limit: u64,
    pub state: MessageState,
    pub attempts: u32,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_event_at: DateTime<Utc>,
    pub final_receipt: Option<FinalReceipt>,
}

impl CrossChainMessage {
    pub fn new(
        message_id: impl Into<String>,
        source_chain: ChainId,
        dest_chain: ChainId,
        token: impl Into<String>,
        amount: u128,
        target_pool: impl Into<String>,
        target_protocol: impl Into<String>,
        gas_limit: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            source_chain,
            dest_chain,
            token: token.into(),
            amount,
            target_pool: target_pool.into(),
            target_protocol: target_protocol.into(),
            fee_native: 0,
            gas_limit,
            state: MessageState::Created,
            attempts: 0,
            submitted_at: None,
            last_event_at: now,
            final_receipt: None,
        }
    }

    /// Attempts a transition, rejecting anything not in `legal_next()` for
    /// the current state — including error states, which are only legal
    /// from the specific states `legal_next()` lists them for.
    pub fn transition(&mut self, to: MessageState, at: DateTime<Utc>) -> Result<(), crate::errors::StateError> {
        if self.state.is_terminal() {
            return Err(crate::errors::StateError {
                message_id: self.message_id.clone(),
                reason: format!("message already in terminal state {:?}", self.state),
            });
        }
        let allowed = self.state.legal_next().contains(&to);
        if !allowed {
            return Err(crate::errors::StateError {
                message_id: self.message_id.clone(),
                reason: format!("illegal transition {:?} -> {:?}", self.state, to),
            });
        }
        self.state = to;
        self.last_event_at = at;
        Ok(())
    }
}
