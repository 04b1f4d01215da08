//! Sends signed transactions straight to the TPU sockets of the current and
//! upcoming slot leaders.

pub mod engine;
pub mod settings;
pub mod tpu_client_turbo;

pub use {
    engine::{TpuClientConfig, TpuSenderError},
    tpu_client_turbo::TpuClient,
};
