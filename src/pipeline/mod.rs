mod errors;
mod ledger_pipeline;
mod records;
#[cfg(test)]
mod tests;

pub use errors::PipelineError;
pub use ledger_pipeline::LedgerPipeline;
pub use records::{read_records, AccountRecord, TransferRecord};
