//! Cross-Chain Execution Orchestrator.

pub mod bridge;
pub mod engine;
pub mod message;

pub use engine::{Orchestrator, RebalanceOutcome};
