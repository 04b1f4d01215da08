//! Scriptable stand-ins for the ledger-state service and the transport.

use {
    super::{
        ledger_provider::{
            LedgerStateProvider, ProviderError, ProviderResult, RoundUpdate,
            INVALID_SLOT_RANGE_MESSAGE,
        },
        transport::{DispatchError, OutboundStream, Transport, TransportConnection},
    },
    async_trait::async_trait,
    solana_sdk::{
        clock::Slot,
        commitment_config::CommitmentConfig,
        epoch_info::EpochInfo,
        hash::Hash,
        pubkey::Pubkey,
        signature::{Keypair, Signature, Signer},
        transaction::{self, Transaction},
    },
    std::{
        collections::{HashMap, HashSet},
        net::{Ipv4Addr, SocketAddr},
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex,
        },
    },
    tokio::{
        sync::mpsc,
        time::{sleep, Duration, Instant},
    },
};

/// `n` distinct leaders, each with its own TPU socket on localhost.
pub(crate) fn leaders_with_addresses(n: usize) -> (Vec<Pubkey>, HashMap<Pubkey, SocketAddr>) {
    let leaders: Vec<Pubkey> = (0..n).map(|_| Pubkey::new_unique()).collect();
    let addresses = leaders
        .iter()
        .enumerate()
        .map(|(i, leader)| {
            (
                *leader,
                SocketAddr::from((Ipv4Addr::LOCALHOST, 9000 + i as u16)),
            )
        })
        .collect();
    (leaders, addresses)
}

/// A signed, bincode-serialized transaction and its signature.
pub(crate) fn signed_wire_transaction() -> (Signature, Vec<u8>) {
    let payer = Keypair::new();
    let transaction =
        Transaction::new_signed_with_payer(&[], Some(&payer.pubkey()), &[&payer], Hash::new_unique());
    (
        transaction.signatures[0],
        bincode::serialize(&transaction).unwrap(),
    )
}

pub(crate) struct MockLedgerProvider {
    pub current_slot: AtomicU64,
    pub slots_in_epoch: AtomicU64,
    /// Leader of slot `s` is `schedule[s % schedule.len()]`.
    pub schedule: Mutex<Vec<Pubkey>>,
    pub addresses: Mutex<HashMap<Pubkey, SocketAddr>>,
    pub signature_statuses: Mutex<HashMap<Signature, transaction::Result<()>>>,
    round_updates: Mutex<Option<mpsc::UnboundedReceiver<RoundUpdate>>>,

    pub fail_current_slot: AtomicBool,
    pub fail_epoch_info: AtomicBool,
    pub fail_slot_leaders: AtomicBool,
    pub fail_cluster_addresses: AtomicBool,
    pub fail_subscribe: AtomicBool,
    /// Number of upcoming schedule fetches that report an invalid slot range.
    pub invalid_slot_range_failures: AtomicUsize,

    pub current_slot_calls: AtomicUsize,
    pub epoch_info_calls: AtomicUsize,
    pub slot_leaders_calls: AtomicUsize,
    pub cluster_address_calls: AtomicUsize,
    pub signature_status_calls: AtomicUsize,
    pub slot_leader_requests: Mutex<Vec<(Slot, u64)>>,
}

impl MockLedgerProvider {
    pub fn new(
        current_slot: Slot,
        schedule: Vec<Pubkey>,
        addresses: HashMap<Pubkey, SocketAddr>,
    ) -> Self {
        Self {
            current_slot: AtomicU64::new(current_slot),
            slots_in_epoch: AtomicU64::new(432_000),
            schedule: Mutex::new(schedule),
            addresses: Mutex::new(addresses),
            signature_statuses: Mutex::new(HashMap::new()),
            round_updates: Mutex::new(None),
            fail_current_slot: AtomicBool::new(false),
            fail_epoch_info: AtomicBool::new(false),
            fail_slot_leaders: AtomicBool::new(false),
            fail_cluster_addresses: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            invalid_slot_range_failures: AtomicUsize::new(0),
            current_slot_calls: AtomicUsize::new(0),
            epoch_info_calls: AtomicUsize::new(0),
            slot_leaders_calls: AtomicUsize::new(0),
            cluster_address_calls: AtomicUsize::new(0),
            signature_status_calls: AtomicUsize::new(0),
            slot_leader_requests: Mutex::new(Vec::new()),
        }
    }

    /// Give the provider a push feed; the returned sender drives it.
    pub fn with_round_updates(self) -> (Self, mpsc::UnboundedSender<RoundUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.round_updates.lock().unwrap() = Some(receiver);
        (self, sender)
    }

    pub fn set_signature_status(&self, signature: Signature, status: transaction::Result<()>) {
        self.signature_statuses
            .lock()
            .unwrap()
            .insert(signature, status);
    }
}

fn injected(what: &str) -> ProviderError {
    ProviderError::Custom(format!("injected {what} failure"))
}

#[async_trait]
impl LedgerStateProvider for MockLedgerProvider {
    async fn get_current_slot(&self, _commitment: CommitmentConfig) -> ProviderResult<Slot> {
        self.current_slot_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_current_slot.load(Ordering::Relaxed) {
            return Err(injected("current slot"));
        }
        Ok(self.current_slot.load(Ordering::Relaxed))
    }

    async fn get_epoch_info(&self, _commitment: CommitmentConfig) -> ProviderResult<EpochInfo> {
        self.epoch_info_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_epoch_info.load(Ordering::Relaxed) {
            return Err(injected("epoch info"));
        }
        let absolute_slot = self.current_slot.load(Ordering::Relaxed);
        let slots_in_epoch = self.slots_in_epoch.load(Ordering::Relaxed);
        Ok(EpochInfo {
            epoch: absolute_slot / slots_in_epoch,
            slot_index: absolute_slot % slots_in_epoch,
            slots_in_epoch,
            absolute_slot,
            block_height: absolute_slot,
            transaction_count: None,
        })
    }

    async fn get_slot_leaders(&self, start_slot: Slot, limit: u64) -> ProviderResult<Vec<Pubkey>> {
        self.slot_leaders_calls.fetch_add(1, Ordering::Relaxed);
        self.slot_leader_requests
            .lock()
            .unwrap()
            .push((start_slot, limit));
        if self.fail_slot_leaders.load(Ordering::Relaxed) {
            return Err(injected("slot leaders"));
        }
        if self
            .invalid_slot_range_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::Custom(format!(
                "{INVALID_SLOT_RANGE_MESSAGE} {start_slot} is unavailable"
            )));
        }
        let schedule = self.schedule.lock().unwrap();
        if schedule.is_empty() {
            return Ok(vec![]);
        }
        Ok((start_slot..start_slot + limit)
            .map(|slot| schedule[(slot % schedule.len() as u64) as usize])
            .collect())
    }

    async fn get_cluster_addresses(&self) -> ProviderResult<HashMap<Pubkey, SocketAddr>> {
        self.cluster_address_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_cluster_addresses.load(Ordering::Relaxed) {
            return Err(injected("cluster addresses"));
        }
        Ok(self.addresses.lock().unwrap().clone())
    }

    async fn get_signature_status(
        &self,
        signature: &Signature,
        _commitment: CommitmentConfig,
    ) -> ProviderResult<Option<transaction::Result<()>>> {
        self.signature_status_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self.signature_statuses.lock().unwrap().get(signature).cloned())
    }

    async fn subscribe_round_updates(
        &self,
    ) -> ProviderResult<Option<mpsc::UnboundedReceiver<RoundUpdate>>> {
        if self.fail_subscribe.load(Ordering::Relaxed) {
            return Err(injected("subscribe"));
        }
        Ok(self.round_updates.lock().unwrap().take())
    }
}

#[derive(Default)]
pub(crate) struct MockTransportState {
    pub connect_calls: AtomicUsize,
    pub connect_log: Mutex<Vec<(SocketAddr, Instant)>>,
    pub streams_opened: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub delivered: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    /// Connect attempts to these targets are refused.
    pub failing_targets: Mutex<HashSet<SocketAddr>>,
    pub fail_all: AtomicBool,
    pub fail_writes: AtomicBool,
    pub connect_delay: Mutex<Duration>,
}

#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    pub state: Arc<MockTransportState>,
}

impl MockTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.state.fail_all.store(true, Ordering::Relaxed);
        transport
    }

    pub fn fail_target(&self, target: SocketAddr) {
        self.state.failing_targets.lock().unwrap().insert(target);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock().unwrap() = delay;
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::Relaxed)
    }

    pub fn connect_calls_to(&self, target: SocketAddr) -> usize {
        self.state
            .connect_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(addr, _)| *addr == target)
            .count()
    }

    pub fn connects_after(&self, instant: Instant) -> usize {
        self.state
            .connect_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, at)| *at > instant)
            .count()
    }

    pub fn delivered(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.state.delivered.lock().unwrap().clone()
    }

    pub fn connections_closed(&self) -> usize {
        self.state.connections_closed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn connect(&self, addr: SocketAddr) -> Result<MockConnection, DispatchError> {
        self.state.connect_calls.fetch_add(1, Ordering::Relaxed);
        self.state
            .connect_log
            .lock()
            .unwrap()
            .push((addr, Instant::now()));
        let delay = *self.state.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.state.fail_all.load(Ordering::Relaxed)
            || self.state.failing_targets.lock().unwrap().contains(&addr)
        {
            return Err(DispatchError::Custom(format!("connection to {addr} refused")));
        }
        Ok(MockConnection {
            addr,
            state: self.state.clone(),
        })
    }
}

pub(crate) struct MockConnection {
    addr: SocketAddr,
    state: Arc<MockTransportState>,
}

#[async_trait]
impl TransportConnection for MockConnection {
    type Stream = MockStream;

    async fn open_outbound_stream(&self) -> Result<MockStream, DispatchError> {
        self.state.streams_opened.fetch_add(1, Ordering::Relaxed);
        Ok(MockStream {
            addr: self.addr,
            buf: Vec::new(),
            state: self.state.clone(),
        })
    }

    fn close(&self) {
        self.state.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct MockStream {
    addr: SocketAddr,
    buf: Vec<u8>,
    state: Arc<MockTransportState>,
}

#[async_trait]
impl OutboundStream for MockStream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), DispatchError> {
        if self.state.fail_writes.load(Ordering::Relaxed) {
            return Err(DispatchError::StreamClosed);
        }
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), DispatchError> {
        self.state
            .delivered
            .lock()
            .unwrap()
            .push((self.addr, std::mem::take(&mut self.buf)));
        Ok(())
    }
}
