//! The three-agent decision pipeline: Signal, Strategy, Voting. Each
//! stage consumes the prior stage's output and the pipeline as a whole
//! reduces a [`crate::model::MarketSnapshot`] to a single
//! [`crate::model::Decision`].

pub mod signal;
pub mod strategy;
pub mod voting;
