pub mod batch;
pub mod client;
pub mod codec;
pub mod config;
mod execution;
pub mod metadata;
pub mod params;
pub mod prepared;
pub mod result_stream;
pub mod retry;
pub mod state_machine;
pub mod status;
pub mod transport;
pub mod types;
pub mod values;
pub mod wire;
