use {
    super::{
        backend_tpu_client::{Result, TpuSenderError},
        config::schedule_fetch_size,
        ledger_provider::{LedgerStateProvider, ProviderError},
    },
    log::*,
    solana_measure::measure::Measure,
    solana_sdk::{clock::Slot, commitment_config::CommitmentConfig, pubkey::Pubkey},
    std::{
        collections::{HashMap, HashSet},
        net::SocketAddr,
        sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    },
    tokio::time::{sleep, Duration, Instant},
};

// When a cluster is starting, we observe an invalid slot range failure that goes away after a
// retry. It seems as if the leader schedule is not available, but it should be.
const LOAD_SCHEDULE_TIMEOUT: Duration = Duration::from_secs(20);
const LOAD_SCHEDULE_RETRY_INTERVAL: Duration = Duration::from_secs(1);

fn epoch_info_commitment() -> CommitmentConfig {
    CommitmentConfig::confirmed()
}

/// Contiguous run of slot leaders starting at `first_slot`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderSchedule {
    first_slot: Slot,
    leaders: Vec<Pubkey>,
}

impl LeaderSchedule {
    pub fn first_slot(&self) -> Slot {
        self.first_slot
    }

    pub fn leaders(&self) -> &[Pubkey] {
        &self.leaders
    }

    // Last slot that has a cached leader pubkey
    pub fn last_slot(&self) -> Slot {
        self.first_slot + self.leaders.len().saturating_sub(1) as u64
    }

    pub fn get_slot_leader(&self, slot: Slot) -> Option<&Pubkey> {
        if slot >= self.first_slot {
            let index = slot - self.first_slot;
            self.leaders.get(index as usize)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct EpochTracking {
    slots_in_epoch: Slot,
    last_epoch_info_slot: Slot,
}

/// Leader schedule and leader-to-TPU address book for a window of upcoming
/// slots.
///
/// Refreshes fetch first and publish afterwards with a single assignment, so
/// a reader sees either the old or the new schedule and never a mix. A failed
/// refresh leaves the published state untouched.
pub struct LeaderTpuCache {
    provider: Arc<dyn LedgerStateProvider>,
    schedule: RwLock<LeaderSchedule>,
    leader_tpu_map: RwLock<HashMap<Pubkey, SocketAddr>>,
    epoch: RwLock<EpochTracking>,
}

impl LeaderTpuCache {
    /// Fetch epoch info, the leader schedule from `start_slot` and the cluster
    /// address book. Any failure is fatal: there is no usable partial cache.
    pub(crate) async fn load(
        provider: Arc<dyn LedgerStateProvider>,
        start_slot: Slot,
    ) -> Result<Self> {
        let slots_in_epoch = provider
            .get_epoch_info(epoch_info_commitment())
            .await
            .map_err(|source| TpuSenderError::Initialization {
                stage: "epoch info",
                source,
            })?
            .slots_in_epoch;

        let leaders = Self::load_schedule(provider.as_ref(), start_slot, slots_in_epoch)
            .await
            .map_err(|source| TpuSenderError::Initialization {
                stage: "leader schedule",
                source,
            })?;

        let leader_tpu_map = provider.get_cluster_addresses().await.map_err(|source| {
            TpuSenderError::Initialization {
                stage: "cluster addresses",
                source,
            }
        })?;

        info!(
            "Loaded {} slot leaders from slot {} and {} TPU addresses ({} slots per epoch)",
            leaders.len(),
            start_slot,
            leader_tpu_map.len(),
            slots_in_epoch
        );

        Ok(Self {
            provider,
            schedule: RwLock::new(LeaderSchedule {
                first_slot: start_slot,
                leaders,
            }),
            leader_tpu_map: RwLock::new(leader_tpu_map),
            epoch: RwLock::new(EpochTracking {
                slots_in_epoch,
                last_epoch_info_slot: start_slot,
            }),
        })
    }

    async fn load_schedule(
        provider: &dyn LedgerStateProvider,
        start_slot: Slot,
        slots_in_epoch: Slot,
    ) -> std::result::Result<Vec<Pubkey>, ProviderError> {
        let deadline = Instant::now() + LOAD_SCHEDULE_TIMEOUT;
        loop {
            match provider
                .get_slot_leaders(start_slot, schedule_fetch_size(slots_in_epoch))
                .await
            {
                Ok(leaders) if leaders.is_empty() => {
                    return Err(ProviderError::Custom(format!(
                        "empty leader schedule from slot {start_slot}"
                    )));
                }
                Ok(leaders) => return Ok(leaders),
                Err(err)
                    if err.is_invalid_slot_range()
                        && Instant::now() + LOAD_SCHEDULE_RETRY_INTERVAL < deadline =>
                {
                    debug!("Leader schedule not available yet, retrying: {}", err);
                    sleep(LOAD_SCHEDULE_RETRY_INTERVAL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Replace the address book wholesale. On failure the current book stays.
    pub(crate) async fn refresh_addresses(&self) -> Result<()> {
        let mut measure = Measure::start("refresh_addresses");
        let leader_tpu_map = self.provider.get_cluster_addresses().await.map_err(|err| {
            warn!("Failed to fetch cluster tpu sockets: {}", err);
            err
        })?;
        measure.stop();
        debug!(
            "Refreshed {} cluster tpu sockets in {}ms",
            leader_tpu_map.len(),
            measure.as_ms()
        );
        *write_lock(&self.leader_tpu_map) = leader_tpu_map;
        Ok(())
    }

    /// Re-read epoch info; on success the epoch info is stamped with
    /// `estimated_current_slot`.
    pub(crate) async fn refresh_epoch_info(&self, estimated_current_slot: Slot) -> Result<()> {
        let epoch_info = self
            .provider
            .get_epoch_info(epoch_info_commitment())
            .await
            .map_err(|err| {
                warn!("Failed to fetch epoch info: {}", err);
                err
            })?;
        *write_lock(&self.epoch) = EpochTracking {
            slots_in_epoch: epoch_info.slots_in_epoch,
            last_epoch_info_slot: estimated_current_slot,
        };
        Ok(())
    }

    /// Fetch the schedule starting at `from_slot` and publish it in one step.
    pub(crate) async fn refresh_schedule(&self, from_slot: Slot, slots_in_epoch: Slot) -> Result<()> {
        let mut measure = Measure::start("refresh_schedule");
        let leaders = self
            .provider
            .get_slot_leaders(from_slot, schedule_fetch_size(slots_in_epoch))
            .await
            .and_then(|leaders| {
                if leaders.is_empty() {
                    Err(ProviderError::Custom(format!(
                        "empty leader schedule from slot {from_slot}"
                    )))
                } else {
                    Ok(leaders)
                }
            })
            .map_err(|err| {
                warn!(
                    "Failed to fetch slot leaders (current estimated slot: {}): {}",
                    from_slot, err
                );
                err
            })?;
        measure.stop();
        debug!(
            "Refreshed {} slot leaders from slot {} in {}ms",
            leaders.len(),
            from_slot,
            measure.as_ms()
        );

        let schedule = LeaderSchedule {
            first_slot: from_slot,
            leaders,
        };
        *write_lock(&self.schedule) = schedule;
        Ok(())
    }

    // Last slot that has a cached leader pubkey
    pub fn last_slot(&self) -> Slot {
        read_lock(&self.schedule).last_slot()
    }

    pub fn first_slot(&self) -> Slot {
        read_lock(&self.schedule).first_slot
    }

    pub fn slots_in_epoch(&self) -> Slot {
        read_lock(&self.epoch).slots_in_epoch
    }

    /// `(last cached slot, slot of the last epoch info refresh, slots in epoch)`
    pub fn slot_info(&self) -> (Slot, Slot, Slot) {
        let epoch = *read_lock(&self.epoch);
        (
            self.last_slot(),
            epoch.last_epoch_info_slot,
            epoch.slots_in_epoch,
        )
    }

    /// Leader for `slot`, or `None` when the slot is outside the cached window.
    pub fn get_slot_leader(&self, slot: Slot) -> Option<Pubkey> {
        read_lock(&self.schedule).get_slot_leader(slot).copied()
    }

    pub fn schedule(&self) -> LeaderSchedule {
        read_lock(&self.schedule).clone()
    }

    pub fn known_tpu_sockets(&self) -> usize {
        read_lock(&self.leader_tpu_map).len()
    }

    /// TPU sockets of the first `fanout_slots` cached leaders, in schedule
    /// order. Leaders without a known socket are skipped and a socket already
    /// collected is not repeated, so the result may hold fewer than
    /// `fanout_slots` entries or none at all.
    pub fn get_unique_leader_sockets(&self, fanout_slots: u64) -> Vec<SocketAddr> {
        let schedule = read_lock(&self.schedule);
        let leader_tpu_map = read_lock(&self.leader_tpu_map);

        let mut unique_sockets = Vec::new();
        let mut seen = HashSet::new();
        for (offset, leader) in schedule
            .leaders
            .iter()
            .take(fanout_slots as usize)
            .enumerate()
        {
            match leader_tpu_map.get(leader) {
                Some(tpu_socket) => {
                    if seen.insert(*tpu_socket) {
                        unique_sockets.push(*tpu_socket);
                    }
                }
                // The leader is probably delinquent
                None => trace!(
                    "TPU not available for leader {} (slot {})",
                    leader,
                    schedule.first_slot + offset as u64
                ),
            }
        }
        unique_sockets
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::engine::test_utils::{leaders_with_addresses, MockLedgerProvider},
        std::sync::atomic::Ordering,
    };

    async fn load_cache(provider: &Arc<MockLedgerProvider>, start_slot: Slot) -> LeaderTpuCache {
        LeaderTpuCache::load(provider.clone(), start_slot)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_load_fetches_fanout_sized_schedule() {
        let (leaders, addresses) = leaders_with_addresses(4);
        let provider = Arc::new(MockLedgerProvider::new(100, leaders.clone(), addresses));
        let cache = load_cache(&provider, 100).await;

        assert_eq!(cache.first_slot(), 100);
        assert_eq!(cache.last_slot(), 100 + 200 - 1);
        assert_eq!(cache.slot_info(), (299, 100, 432_000));
        assert_eq!(cache.known_tpu_sockets(), 4);
        assert_eq!(cache.get_slot_leader(99), None);
        assert_eq!(cache.get_slot_leader(100), Some(leaders[0]));
        assert_eq!(cache.get_slot_leader(103), Some(leaders[3]));
        assert_eq!(cache.get_slot_leader(300), None);
    }

    #[tokio::test]
    async fn test_load_fanout_limited_by_epoch_length() {
        let (leaders, addresses) = leaders_with_addresses(2);
        let provider = Arc::new(MockLedgerProvider::new(0, leaders, addresses));
        provider.slots_in_epoch.store(32, Ordering::Relaxed);
        let cache = load_cache(&provider, 0).await;
        assert_eq!(cache.schedule().leaders().len(), 32);
        assert_eq!(cache.last_slot(), 31);
    }

    #[tokio::test]
    async fn test_load_failures_are_fatal() {
        let (leaders, addresses) = leaders_with_addresses(2);
        let provider = Arc::new(MockLedgerProvider::new(0, leaders, addresses));

        provider.fail_epoch_info.store(true, Ordering::Relaxed);
        let err = LeaderTpuCache::load(provider.clone(), 0).await.err().unwrap();
        assert!(matches!(
            err,
            TpuSenderError::Initialization {
                stage: "epoch info",
                ..
            }
        ));
        provider.fail_epoch_info.store(false, Ordering::Relaxed);

        provider.fail_slot_leaders.store(true, Ordering::Relaxed);
        let err = LeaderTpuCache::load(provider.clone(), 0).await.err().unwrap();
        assert!(matches!(
            err,
            TpuSenderError::Initialization {
                stage: "leader schedule",
                ..
            }
        ));
        provider.fail_slot_leaders.store(false, Ordering::Relaxed);

        provider.fail_cluster_addresses.store(true, Ordering::Relaxed);
        let err = LeaderTpuCache::load(provider.clone(), 0).await.err().unwrap();
        assert!(matches!(
            err,
            TpuSenderError::Initialization {
                stage: "cluster addresses",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_load_rejects_empty_schedule() {
        let provider = Arc::new(MockLedgerProvider::new(0, vec![], HashMap::new()));
        assert!(matches!(
            LeaderTpuCache::load(provider, 0).await,
            Err(TpuSenderError::Initialization {
                stage: "leader schedule",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_load_retries_invalid_slot_range() {
        let (leaders, addresses) = leaders_with_addresses(2);
        let provider = Arc::new(MockLedgerProvider::new(0, leaders, addresses));
        provider
            .invalid_slot_range_failures
            .store(1, Ordering::Relaxed);
        let cache = load_cache(&provider, 0).await;
        assert_eq!(provider.slot_leaders_calls.load(Ordering::Relaxed), 2);
        assert_eq!(cache.first_slot(), 0);
    }

    #[tokio::test]
    async fn test_unique_leader_sockets_skip_duplicates_and_unknown() {
        let (leaders, mut addresses) = leaders_with_addresses(3);
        // Leaders hold 4 consecutive slots each: a a a a b b b b c c c c ...
        let schedule: Vec<Pubkey> = leaders
            .iter()
            .flat_map(|leader| std::iter::repeat(*leader).take(4))
            .collect();
        let unknown = leaders[1];
        addresses.remove(&unknown);
        let provider = Arc::new(MockLedgerProvider::new(0, schedule, addresses.clone()));
        let cache = load_cache(&provider, 0).await;

        let sockets = cache.get_unique_leader_sockets(12);
        assert_eq!(sockets, vec![addresses[&leaders[0]], addresses[&leaders[2]]]);

        let sockets = cache.get_unique_leader_sockets(4);
        assert_eq!(sockets, vec![addresses[&leaders[0]]]);

        // Only the unknown leader in range: empty, not an error.
        let provider = Arc::new(MockLedgerProvider::new(
            0,
            vec![unknown],
            addresses.clone(),
        ));
        let cache = load_cache(&provider, 0).await;
        assert!(cache.get_unique_leader_sockets(12).is_empty());
    }

    #[tokio::test]
    async fn test_unique_leader_sockets_never_repeat() {
        let (leaders, mut addresses) = leaders_with_addresses(6);
        // Two identities sharing one socket must still be sent to only once.
        addresses.insert(leaders[5], addresses[&leaders[0]]);
        let pattern = [0, 1, 0, 2, 2, 5, 3, 1, 4, 0, 5, 3];
        let schedule: Vec<Pubkey> = pattern.iter().map(|i| leaders[*i]).collect();

        // Every subset of leaders missing from the address book.
        for missing_mask in 0u32..(1 << leaders.len()) {
            let book: HashMap<Pubkey, SocketAddr> = addresses
                .iter()
                .filter(|(leader, _)| {
                    let index = leaders.iter().position(|l| l == *leader).unwrap();
                    missing_mask & (1 << index) == 0
                })
                .map(|(leader, socket)| (*leader, *socket))
                .collect();
            let provider = Arc::new(MockLedgerProvider::new(0, schedule.clone(), book.clone()));
            let cache = load_cache(&provider, 0).await;

            for fanout in 1..=20u64 {
                let sockets = cache.get_unique_leader_sockets(fanout);
                let unique: HashSet<_> = sockets.iter().collect();
                assert_eq!(unique.len(), sockets.len());

                let mut expected = vec![];
                for slot in 0..fanout {
                    let leader = schedule[slot as usize % schedule.len()];
                    if let Some(socket) = book.get(&leader) {
                        if !expected.contains(socket) {
                            expected.push(*socket);
                        }
                    }
                }
                assert_eq!(sockets, expected, "mask {missing_mask:#08b} fanout {fanout}");
            }
        }
    }

    #[tokio::test]
    async fn test_failed_schedule_refresh_keeps_cache() {
        let (leaders, addresses) = leaders_with_addresses(3);
        let provider = Arc::new(MockLedgerProvider::new(10, leaders, addresses));
        let cache = load_cache(&provider, 10).await;

        let last_slot = cache.last_slot();
        let before: Vec<_> = (0..320).map(|slot| cache.get_slot_leader(slot)).collect();

        provider.fail_slot_leaders.store(true, Ordering::Relaxed);
        assert!(matches!(
            cache.refresh_schedule(150, 432_000).await,
            Err(TpuSenderError::Refresh(_))
        ));

        assert_eq!(cache.last_slot(), last_slot);
        let after: Vec<_> = (0..320).map(|slot| cache.get_slot_leader(slot)).collect();
        assert_eq!(before, after);

        provider.fail_slot_leaders.store(false, Ordering::Relaxed);
        cache.refresh_schedule(150, 432_000).await.unwrap();
        assert_eq!(cache.first_slot(), 150);
        assert_eq!(cache.last_slot(), 349);
    }

    #[tokio::test]
    async fn test_empty_schedule_refresh_keeps_cache() {
        let (leaders, addresses) = leaders_with_addresses(3);
        let provider = Arc::new(MockLedgerProvider::new(10, leaders, addresses));
        let cache = load_cache(&provider, 10).await;
        let schedule = cache.schedule();

        provider.schedule.lock().unwrap().clear();
        assert!(cache.refresh_schedule(50, 432_000).await.is_err());
        assert_eq!(cache.schedule(), schedule);
    }

    #[tokio::test]
    async fn test_failed_address_refresh_keeps_book() {
        let (leaders, addresses) = leaders_with_addresses(3);
        let provider = Arc::new(MockLedgerProvider::new(0, leaders, addresses));
        let cache = load_cache(&provider, 0).await;
        let sockets = cache.get_unique_leader_sockets(3);

        provider.fail_cluster_addresses.store(true, Ordering::Relaxed);
        assert!(cache.refresh_addresses().await.is_err());
        assert_eq!(cache.get_unique_leader_sockets(3), sockets);

        provider.fail_cluster_addresses.store(false, Ordering::Relaxed);
        provider.addresses.lock().unwrap().clear();
        cache.refresh_addresses().await.unwrap();
        assert!(cache.get_unique_leader_sockets(3).is_empty());
    }

    #[tokio::test]
    async fn test_epoch_info_refresh() {
        let (leaders, addresses) = leaders_with_addresses(1);
        let provider = Arc::new(MockLedgerProvider::new(0, leaders, addresses));
        let cache = load_cache(&provider, 0).await;

        provider.slots_in_epoch.store(8_192, Ordering::Relaxed);
        provider.fail_epoch_info.store(true, Ordering::Relaxed);
        assert!(cache.refresh_epoch_info(77).await.is_err());
        assert_eq!(cache.slot_info().1, 0);
        assert_eq!(cache.slots_in_epoch(), 432_000);

        provider.fail_epoch_info.store(false, Ordering::Relaxed);
        cache.refresh_epoch_info(77).await.unwrap();
        assert_eq!(cache.slot_info().1, 77);
        assert_eq!(cache.slots_in_epoch(), 8_192);
    }
}
