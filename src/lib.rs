pub mod buffer;
pub mod config;
pub mod engine;
pub mod models;
pub mod pipeline;
pub mod publisher;
pub mod services;
pub mod shutdown;
pub mod storage;
pub mod types;
