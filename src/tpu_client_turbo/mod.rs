use {
    crate::engine::{
        AbortableSend, BackendTpuClient, LedgerStateProvider, QuicTransport, Result,
        RpcLedgerProvider, TpuClientConfig, TpuSenderError, Transport,
    },
    solana_rpc_client::nonblocking::rpc_client::RpcClient,
    solana_sdk::{
        commitment_config::CommitmentConfig,
        signature::{Keypair, Signature},
        transaction::Transaction,
    },
    std::sync::Arc,
    tokio::time::{sleep, Duration, Instant},
    tracing::{debug, info, warn},
};

/// Client which sends transactions directly to the current and upcoming
/// leaders' TPU sockets and can wait for them to land.
pub struct TpuClient<T: Transport> {
    tpu_client: BackendTpuClient<T>,
    provider: Arc<dyn LedgerStateProvider>,
    confirmation_timeout: Duration,
    confirmation_poll_interval: Duration,
}

impl TpuClient<QuicTransport> {
    /// Track leaders through `rpc_client` (and `websocket_url` for slot
    /// updates, if non-empty) and send over QUIC authenticated as `identity`.
    pub async fn new(
        rpc_client: Arc<RpcClient>,
        websocket_url: &str,
        identity: &Keypair,
        config: TpuClientConfig,
    ) -> Result<Self> {
        let transport = Arc::new(QuicTransport::new(identity, config.connect_timeout)?);
        let provider = Arc::new(RpcLedgerProvider::new(rpc_client, websocket_url));
        Self::new_with_transport(provider, transport, config).await
    }
}

impl<T: Transport> TpuClient<T> {
    pub async fn new_with_transport(
        provider: Arc<dyn LedgerStateProvider>,
        transport: Arc<T>,
        config: TpuClientConfig,
    ) -> Result<Self> {
        let confirmation_timeout = config.confirmation_timeout;
        let confirmation_poll_interval = config.confirmation_poll_interval;
        let tpu_client = BackendTpuClient::new(provider.clone(), transport, config).await?;
        Ok(Self {
            tpu_client,
            provider,
            confirmation_timeout,
            confirmation_poll_interval,
        })
    }

    pub fn backend(&self) -> &BackendTpuClient<T> {
        &self.tpu_client
    }

    /// Serialize and send transaction to the current and upcoming leader TPUs
    /// according to fanout size
    pub fn send_transaction(&self, transaction: &Transaction) -> Result<Signature> {
        self.tpu_client.send_transaction(transaction)
    }

    /// Send a wire transaction to the current and upcoming leader TPUs
    /// according to fanout size
    pub fn send_wire_transaction(&self, wire_transaction: Vec<u8>) -> Result<Signature> {
        self.tpu_client.send_wire_transaction(wire_transaction)
    }

    pub fn send_wire_transaction_abortable(&self, wire_transaction: Vec<u8>) -> Result<AbortableSend> {
        self.tpu_client
            .send_wire_transaction_abortable(wire_transaction)
    }

    pub async fn send_and_confirm_transaction(
        &self,
        transaction: &Transaction,
        commitment: CommitmentConfig,
    ) -> Result<Signature> {
        let wire_transaction = bincode::serialize(transaction)
            .map_err(|err| TpuSenderError::MalformedPayload(err.to_string()))?;
        self.send_and_confirm_wire_transaction(wire_transaction, commitment)
            .await
    }

    /// Send, then poll the signature status until it reaches `commitment`.
    ///
    /// Outstanding dispatches are cancelled before returning, whatever the
    /// outcome, so no retries outlive the call.
    pub async fn send_and_confirm_wire_transaction(
        &self,
        wire_transaction: Vec<u8>,
        commitment: CommitmentConfig,
    ) -> Result<Signature> {
        let send = self
            .tpu_client
            .send_wire_transaction_abortable(wire_transaction)?;
        let signature = send.signature;
        debug!(%signature, targets = send.handles.len(), "Waiting for confirmation");

        let started = Instant::now();
        let result = self.wait_for_confirmation(&signature, commitment).await;
        send.cancel_all();

        match &result {
            Ok(()) => info!(
                %signature,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Transaction confirmed"
            ),
            Err(err) => warn!(%signature, error = %err, "Transaction not confirmed"),
        }
        result.map(|()| signature)
    }

    async fn wait_for_confirmation(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> Result<()> {
        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            match self.provider.get_signature_status(signature, commitment).await {
                Ok(Some(Ok(()))) => return Ok(()),
                Ok(Some(Err(err))) => {
                    return Err(TpuSenderError::TransactionFailed {
                        signature: *signature,
                        err,
                    })
                }
                Ok(None) => {}
                Err(err) => debug!(%signature, error = %err, "Signature status query failed"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TpuSenderError::ConfirmationTimeout(*signature));
            }
            sleep(self.confirmation_poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.tpu_client.shutdown().await;
    }
}
