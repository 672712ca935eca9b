//! Integration tests: the orchestrator driven end to end against
//! in-memory market data and execution mocks.

mod lifecycle;
mod mocks;
