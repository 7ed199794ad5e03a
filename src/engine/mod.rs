mod batch_size;
mod errors;
mod settlement_engine;

pub use batch_size::BatchSizeController;
pub use errors::EngineError;
pub use settlement_engine::{CycleOutcome, CycleReport, SettlementEngine};
