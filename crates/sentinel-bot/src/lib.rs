//! Sentinel trading engine.
//!
//! Orchestrates the connectivity and resilience core:
//! - Streaming sessions feeding market and account state
//! - Strategy evaluation through the risk gate to order submission
//! - Stop-loss / take-profit exits and balance reconciliation
//! - Breaker health monitoring with an operator-cleared kill-switch

pub mod config;
pub mod engine;
pub mod error;
pub mod strategy;

pub use config::AppConfig;
pub use engine::{Engine, EngineComponents, EngineState, ShutdownReport, TaskExit};
pub use error::{AppError, AppResult, EngineError, EngineResult};
pub use strategy::Strategy;
