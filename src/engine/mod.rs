pub use {
    backend_tpu_client::{
        wire_transaction_signature, AbortableSend, BackendTpuClient, DispatchHandle,
        DispatchOutcome, Result, TpuSenderError,
    },
    config::TpuClientConfig,
    leader_tpu_service::LeaderTpuService,
    ledger_provider::{LedgerStateProvider, ProviderError, RoundUpdate, RpcLedgerProvider},
    quic_transport::QuicTransport,
    transport::{DispatchError, DispatchErrorKind, Transport},
};
pub mod backend_tpu_client;
pub mod config;
pub mod leader_tpu_cache;
pub mod leader_tpu_service;
pub mod ledger_provider;
pub mod quic_transport;
pub mod recent_leaders_slot;
#[cfg(test)]
pub(crate) mod test_utils;
pub mod transport;
