use {
    async_trait::async_trait,
    futures_util::stream::StreamExt,
    log::*,
    solana_pubsub_client::nonblocking::pubsub_client::{PubsubClient, PubsubClientError},
    solana_rpc_client::nonblocking::rpc_client::RpcClient,
    solana_rpc_client_api::{
        client_error::{Error as ClientError, ErrorKind},
        request::RpcError,
        response::{RpcContactInfo, SlotUpdate},
    },
    solana_sdk::{
        clock::Slot,
        commitment_config::CommitmentConfig,
        epoch_info::EpochInfo,
        pubkey::Pubkey,
        quic::QUIC_PORT_OFFSET,
        signature::Signature,
        transaction,
    },
    std::{collections::HashMap, net::SocketAddr, str::FromStr, sync::Arc},
    thiserror::Error,
    tokio::sync::mpsc,
};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("RPC error: {0}")]
    Rpc(#[from] ClientError),
    #[error("Pubsub error: {0}")]
    Pubsub(#[from] PubsubClientError),
    #[error("{0}")]
    Custom(String),
}

impl ProviderError {
    /// While a cluster is starting the leader schedule can briefly be reported
    /// as unavailable even though it is about to be.
    pub fn is_invalid_slot_range(&self) -> bool {
        match self {
            Self::Rpc(client_error) => is_invalid_slot_range_error(client_error),
            Self::Custom(message) => message.contains(INVALID_SLOT_RANGE_MESSAGE),
            Self::Pubsub(_) => false,
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

pub(crate) const INVALID_SLOT_RANGE_MESSAGE: &str = "Invalid slot range: leader schedule for epoch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundUpdateKind {
    /// First shred of the slot was received; its leader is probably still
    /// accepting transactions.
    Started,
    /// The slot is complete; its leader is done.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundUpdate {
    pub slot: Slot,
    pub kind: RoundUpdateKind,
}

impl RoundUpdate {
    pub fn started(slot: Slot) -> Self {
        Self {
            slot,
            kind: RoundUpdateKind::Started,
        }
    }

    pub fn completed(slot: Slot) -> Self {
        Self {
            slot,
            kind: RoundUpdateKind::Completed,
        }
    }

    /// The slot whose leader should receive transactions after this update.
    pub fn next_leader_slot(&self) -> Slot {
        match self.kind {
            RoundUpdateKind::Started => self.slot,
            RoundUpdateKind::Completed => self.slot.saturating_add(1),
        }
    }
}

/// Request/response view of the ledger-state service that the leader tracker
/// and the confirmation workflow depend on.
#[async_trait]
pub trait LedgerStateProvider: Send + Sync {
    async fn get_current_slot(&self, commitment: CommitmentConfig) -> ProviderResult<Slot>;

    async fn get_epoch_info(&self, commitment: CommitmentConfig) -> ProviderResult<EpochInfo>;

    async fn get_slot_leaders(&self, start_slot: Slot, limit: u64) -> ProviderResult<Vec<Pubkey>>;

    /// Ingestion addresses of every node that publishes one.
    async fn get_cluster_addresses(&self) -> ProviderResult<HashMap<Pubkey, SocketAddr>>;

    /// `None` until the signature reaches `commitment`.
    async fn get_signature_status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> ProviderResult<Option<transaction::Result<()>>>;

    /// Push feed of slot progress. `Ok(None)` means the provider has no feed
    /// and callers must poll `get_current_slot` instead.
    async fn subscribe_round_updates(
        &self,
    ) -> ProviderResult<Option<mpsc::UnboundedReceiver<RoundUpdate>>>;
}

/// [`LedgerStateProvider`] backed by a JSON-RPC node and its websocket endpoint.
pub struct RpcLedgerProvider {
    rpc_client: Arc<RpcClient>,
    websocket_url: String,
}

impl RpcLedgerProvider {
    pub fn new(rpc_client: Arc<RpcClient>, websocket_url: impl Into<String>) -> Self {
        Self {
            rpc_client,
            websocket_url: websocket_url.into(),
        }
    }
}

#[async_trait]
impl LedgerStateProvider for RpcLedgerProvider {
    async fn get_current_slot(&self, commitment: CommitmentConfig) -> ProviderResult<Slot> {
        Ok(self.rpc_client.get_slot_with_commitment(commitment).await?)
    }

    async fn get_epoch_info(&self, commitment: CommitmentConfig) -> ProviderResult<EpochInfo> {
        Ok(self
            .rpc_client
            .get_epoch_info_with_commitment(commitment)
            .await?)
    }

    async fn get_slot_leaders(&self, start_slot: Slot, limit: u64) -> ProviderResult<Vec<Pubkey>> {
        Ok(self.rpc_client.get_slot_leaders(start_slot, limit).await?)
    }

    async fn get_cluster_addresses(&self) -> ProviderResult<HashMap<Pubkey, SocketAddr>> {
        let cluster_nodes = self.rpc_client.get_cluster_nodes().await?;
        Ok(extract_cluster_tpu_sockets(cluster_nodes))
    }

    async fn get_signature_status(
        &self,
        signature: &Signature,
        commitment: CommitmentConfig,
    ) -> ProviderResult<Option<transaction::Result<()>>> {
        Ok(self
            .rpc_client
            .get_signature_status_with_commitment(signature, commitment)
            .await?)
    }

    async fn subscribe_round_updates(
        &self,
    ) -> ProviderResult<Option<mpsc::UnboundedReceiver<RoundUpdate>>> {
        if self.websocket_url.is_empty() {
            return Ok(None);
        }

        let pubsub_client = PubsubClient::new(&self.websocket_url).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(forward_slot_updates(pubsub_client, sender));
        Ok(Some(receiver))
    }
}

async fn forward_slot_updates(
    pubsub_client: PubsubClient,
    sender: mpsc::UnboundedSender<RoundUpdate>,
) {
    let (mut notifications, unsubscribe) = match pubsub_client.slot_updates_subscribe().await {
        Ok(subscription) => subscription,
        Err(err) => {
            warn!("Failed to subscribe to slot updates: {}", err);
            return;
        }
    };

    loop {
        let update = tokio::select! {
            _ = sender.closed() => break,
            update = notifications.next() => update,
        };
        let Some(update) = update else {
            warn!("Slot update subscription ended");
            break;
        };
        let update = match update {
            SlotUpdate::FirstShredReceived { slot, .. } => RoundUpdate::started(slot),
            SlotUpdate::Completed { slot, .. } => RoundUpdate::completed(slot),
            _ => continue,
        };
        if sender.send(update).is_err() {
            break;
        }
    }

    // `notifications` borrows `pubsub_client`, so it must go before `shutdown()`.
    drop(notifications);
    unsubscribe().await;
    if let Err(err) = pubsub_client.shutdown().await {
        debug!("Pubsub client shutdown failed: {}", err);
    }
}

/// Maps each contact's identity to its QUIC ingestion port, falling back to
/// the UDP TPU port shifted by `QUIC_PORT_OFFSET`. Contacts without either are
/// left out.
pub fn extract_cluster_tpu_sockets(
    cluster_contact_info: Vec<RpcContactInfo>,
) -> HashMap<Pubkey, SocketAddr> {
    cluster_contact_info
        .into_iter()
        .filter_map(|contact_info| {
            let pubkey = Pubkey::from_str(&contact_info.pubkey).ok()?;
            let socket = contact_info.tpu_quic.or_else(|| {
                let mut socket = contact_info.tpu?;
                let port = socket.port().checked_add(QUIC_PORT_OFFSET)?;
                socket.set_port(port);
                Some(socket)
            })?;
            Some((pubkey, socket))
        })
        .collect()
}

fn is_invalid_slot_range_error(client_error: &ClientError) -> bool {
    if let ErrorKind::RpcError(RpcError::RpcResponseError { code, message, .. }) =
        &client_error.kind
    {
        return *code == -32602 && message.contains(INVALID_SLOT_RANGE_MESSAGE);
    }
    false
}
