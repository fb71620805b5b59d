pub mod config;
pub mod embedding;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod redactor;
pub mod runtime;
pub mod ticket;
pub mod tools;
pub mod web;
pub mod worker;

pub use stockpilot_core::error;
pub use stockpilot_core::events;
pub use stockpilot_core::llm_types;
pub use stockpilot_storage::db;
pub use stockpilot_storage::models;
