use {
    super::{
        config::{TpuClientConfig, MAX_FANOUT_SLOTS},
        leader_tpu_service::LeaderTpuService,
        ledger_provider::{LedgerStateProvider, ProviderError},
        transport::{DispatchError, OutboundStream, Transport, TransportConnection},
    },
    futures_util::future::join_all,
    log::*,
    solana_sdk::{
        signature::Signature,
        transaction::{Transaction, TransactionError, VersionedTransaction},
    },
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    thiserror::Error,
    tokio::{
        runtime::Handle,
        sync::Semaphore,
        task::JoinHandle,
        time::{sleep, Duration},
    },
    tokio_util::sync::CancellationToken,
};

#[derive(Error, Debug)]
pub enum TpuSenderError {
    #[error("failed to initialize leader tracking ({stage}): {source}")]
    Initialization {
        stage: &'static str,
        #[source]
        source: ProviderError,
    },
    #[error("no slot observations recorded")]
    EmptyWindow,
    #[error("malformed transaction payload: {0}")]
    MalformedPayload(String),
    #[error("refresh failed: {0}")]
    Refresh(#[from] ProviderError),
    #[error("transaction {0} was not confirmed in time")]
    ConfirmationTimeout(Signature),
    #[error("transaction {signature} failed: {err}")]
    TransactionFailed {
        signature: Signature,
        err: TransactionError,
    },
    #[error("transport setup error: {0}")]
    Transport(String),
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TpuSenderError>;

/// How a single per-target dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The payload was written and the stream finished.
    Delivered { attempts: usize },
    /// Cancelled before a write succeeded.
    Aborted { attempts: usize },
    /// Every attempt failed.
    Abandoned { attempts: usize },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Handle to one in-flight per-target dispatch.
#[derive(Debug)]
pub struct DispatchHandle {
    target: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<DispatchOutcome>,
}

impl DispatchHandle {
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Ask the dispatch to stop at its next suspension point. A write already
    /// in progress is allowed to complete, after which the connection is
    /// closed.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> DispatchOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!("Dispatch task to {} failed: {}", self.target, err);
                DispatchOutcome::Abandoned { attempts: 0 }
            }
        }
    }
}

/// Result of [`BackendTpuClient::send_wire_transaction_abortable`].
#[derive(Debug)]
pub struct AbortableSend {
    pub signature: Signature,
    pub handles: Vec<DispatchHandle>,
}

impl AbortableSend {
    pub fn cancel_all(&self) {
        self.handles.iter().for_each(DispatchHandle::cancel);
    }

    pub async fn join_all(self) -> Vec<DispatchOutcome> {
        join_all(self.handles.into_iter().map(DispatchHandle::join)).await
    }
}

#[derive(Debug, Clone, Copy)]
struct DispatchConfig {
    retry_max_count: usize,
    retry_delay: Duration,
    connection_linger: Duration,
}

impl From<&TpuClientConfig> for DispatchConfig {
    fn from(config: &TpuClientConfig) -> Self {
        Self {
            retry_max_count: config.retry_max_count.max(1),
            retry_delay: config.retry_delay,
            connection_linger: config.connection_linger,
        }
    }
}

/// Client which sends transactions directly to the current and upcoming
/// leaders' TPU sockets. Leader tracking runs in the background and stops
/// when the client is dropped.
pub struct BackendTpuClient<T: Transport> {
    fanout_slots: u64,
    leader_tpu_service: LeaderTpuService,
    exit: Arc<AtomicBool>,
    transport: Arc<T>,
    runtime: Handle,
    dispatch_permits: Arc<Semaphore>,
    dispatch_config: DispatchConfig,
}

impl<T: Transport> BackendTpuClient<T> {
    /// Start leader tracking against `provider` and send through `transport`.
    pub async fn new(
        provider: Arc<dyn LedgerStateProvider>,
        transport: Arc<T>,
        config: TpuClientConfig,
    ) -> Result<Self> {
        let exit = Arc::new(AtomicBool::new(false));
        let leader_tpu_service = LeaderTpuService::new(provider, &config, exit.clone()).await?;

        Ok(Self {
            fanout_slots: config.fanout_slots.clamp(1, MAX_FANOUT_SLOTS),
            leader_tpu_service,
            exit,
            transport,
            runtime: Handle::current(),
            dispatch_permits: Arc::new(Semaphore::new(config.max_inflight_dispatches.max(1))),
            dispatch_config: DispatchConfig::from(&config),
        })
    }

    pub fn fanout_slots(&self) -> u64 {
        self.fanout_slots
    }

    pub fn leader_tpu_service(&self) -> &LeaderTpuService {
        &self.leader_tpu_service
    }

    /// Serialize and send transaction to the current and upcoming leader TPUs
    /// according to fanout size
    pub fn send_transaction(&self, transaction: &Transaction) -> Result<Signature> {
        let wire_transaction = bincode::serialize(transaction)
            .map_err(|err| TpuSenderError::MalformedPayload(err.to_string()))?;
        self.send_wire_transaction(wire_transaction)
    }

    /// Send a wire transaction to the current and upcoming leader TPUs
    /// according to fanout size.
    ///
    /// Returns as soon as the dispatches are started; delivery failures are
    /// logged and never reported here. Dispatches run on the runtime the
    /// client was created on, so this may be called from any thread.
    pub fn send_wire_transaction(&self, wire_transaction: Vec<u8>) -> Result<Signature> {
        let (signature, _handles) = self.spawn_dispatches(wire_transaction)?;
        Ok(signature)
    }

    /// Like [`Self::send_wire_transaction`], but hands back one cancellation
    /// handle per target so the caller can stop retries once it has seen the
    /// transaction land.
    pub fn send_wire_transaction_abortable(&self, wire_transaction: Vec<u8>) -> Result<AbortableSend> {
        let (signature, handles) = self.spawn_dispatches(wire_transaction)?;
        Ok(AbortableSend { signature, handles })
    }

    fn spawn_dispatches(&self, wire_transaction: Vec<u8>) -> Result<(Signature, Vec<DispatchHandle>)> {
        let signature = wire_transaction_signature(&wire_transaction)?;
        let leaders = self
            .leader_tpu_service
            .unique_leader_tpu_sockets(self.fanout_slots);
        if leaders.is_empty() {
            warn!("No leader TPU sockets available for transaction {}", signature);
        }

        let wire_transaction: Arc<[u8]> = wire_transaction.into();
        let handles = leaders
            .into_iter()
            .map(|target| {
                let cancel = CancellationToken::new();
                let task = self.runtime.spawn(dispatch_with_retry(
                    self.transport.clone(),
                    self.dispatch_permits.clone(),
                    target,
                    wire_transaction.clone(),
                    self.dispatch_config,
                    cancel.clone(),
                ));
                DispatchHandle {
                    target,
                    cancel,
                    task,
                }
            })
            .collect();
        Ok((signature, handles))
    }

    pub async fn shutdown(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
        self.leader_tpu_service.join().await;
    }
}

impl<T: Transport> Drop for BackendTpuClient<T> {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::Relaxed);
    }
}

/// First signature of a bincode-encoded legacy or versioned transaction.
pub fn wire_transaction_signature(wire_transaction: &[u8]) -> Result<Signature> {
    let transaction: VersionedTransaction = bincode::deserialize(wire_transaction)
        .map_err(|err| TpuSenderError::MalformedPayload(err.to_string()))?;
    transaction
        .signatures
        .first()
        .copied()
        .ok_or_else(|| TpuSenderError::MalformedPayload("transaction has no signatures".to_string()))
}

enum Attempt<C> {
    Sent(C),
    Cancelled,
    Failed(DispatchError),
}

async fn dispatch_with_retry<T: Transport>(
    transport: Arc<T>,
    dispatch_permits: Arc<Semaphore>,
    target: SocketAddr,
    wire_transaction: Arc<[u8]>,
    config: DispatchConfig,
    cancel: CancellationToken,
) -> DispatchOutcome {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return DispatchOutcome::Aborted { attempts: 0 },
        permit = dispatch_permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return DispatchOutcome::Abandoned { attempts: 0 },
        },
    };

    let mut attempts = 0;
    while attempts < config.retry_max_count {
        if cancel.is_cancelled() {
            return DispatchOutcome::Aborted { attempts };
        }
        if attempts > 0 && !config.retry_delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return DispatchOutcome::Aborted { attempts },
                _ = sleep(config.retry_delay) => {}
            }
        }
        attempts += 1;

        match send_once(transport.as_ref(), target, &wire_transaction, &cancel).await {
            Attempt::Sent(connection) => {
                trace!("Sent transaction to {} (attempt {})", target, attempts);
                // The permit bounds connects and writes, not connections waiting to close.
                drop(permit);
                // Closing right away can drop the stream before it is flushed.
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(config.connection_linger) => {}
                }
                connection.close();
                return DispatchOutcome::Delivered { attempts };
            }
            Attempt::Cancelled => return DispatchOutcome::Aborted { attempts },
            Attempt::Failed(err) => debug!(
                "Failed to send transaction to {} (attempt {}/{}, {}): {}",
                target,
                attempts,
                config.retry_max_count,
                err.kind(),
                err
            ),
        }
    }

    warn!(
        "Giving up on {} after {} failed attempts",
        target, attempts
    );
    DispatchOutcome::Abandoned { attempts }
}

async fn send_once<T: Transport>(
    transport: &T,
    target: SocketAddr,
    wire_transaction: &[u8],
    cancel: &CancellationToken,
) -> Attempt<T::Connection> {
    let connection = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Attempt::Cancelled,
        connection = transport.connect(target) => match connection {
            Ok(connection) => connection,
            Err(err) => return Attempt::Failed(err),
        },
    };

    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            connection.close();
            return Attempt::Cancelled;
        }
        stream = connection.open_outbound_stream() => match stream {
            Ok(stream) => stream,
            Err(err) => {
                connection.close();
                return Attempt::Failed(err);
            }
        },
    };

    // Once started, the write runs to completion regardless of cancellation.
    match stream
        .write_all(wire_transaction)
        .await
        .and_then(|()| stream.finish())
    {
        Ok(()) => Attempt::Sent(connection),
        Err(err) => {
            connection.close();
            Attempt::Failed(err)
        }
    }
}
