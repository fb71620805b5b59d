//! Shared leaf types for StockPilot.

pub mod error;
pub mod events;
pub mod llm_types;
