//! Core engine: lifecycle control, positions, execution, and the
//! orchestrator that runs the trading cycle.

pub mod control;
pub mod executor;
pub mod health;
pub mod orchestrator;
pub mod performance;
pub mod positions;
