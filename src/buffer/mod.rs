mod errors;
mod transfer_buffer;

pub use errors::BufferError;
pub use transfer_buffer::TransferBuffer;
