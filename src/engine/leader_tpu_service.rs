use {
    super::{
        backend_tpu_client::{Result, TpuSenderError},
        config::{TpuClientConfig, MAX_FANOUT_SLOTS},
        leader_tpu_cache::LeaderTpuCache,
        ledger_provider::{LedgerStateProvider, RoundUpdate},
        recent_leaders_slot::RecentLeaderSlots,
    },
    log::*,
    solana_sdk::{clock::Slot, commitment_config::CommitmentConfig, pubkey::Pubkey},
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
    tokio::{
        sync::mpsc::UnboundedReceiver,
        task::JoinHandle,
        time::{sleep, timeout, Duration, Instant},
    },
};

// Waits on round updates and timers are cut short every 10ms to re-check the
// exit flag. Must stay well below the slot time.
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Service that tracks upcoming leaders and maintains an up-to-date mapping
/// of leader id to TPU socket address.
///
/// The recent slot window and the leader cache are written only by the
/// service's own background task; everything else goes through the read
/// accessors below.
pub struct LeaderTpuService {
    recent_slots: RecentLeaderSlots,
    leader_tpu_cache: Arc<LeaderTpuCache>,
    t_leader_tpu_service: Option<JoinHandle<()>>,
}

impl LeaderTpuService {
    pub async fn new(
        provider: Arc<dyn LedgerStateProvider>,
        config: &TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) -> Result<Self> {
        let start_slot = provider
            .get_current_slot(CommitmentConfig::processed())
            .await
            .map_err(|source| TpuSenderError::Initialization {
                stage: "current slot",
                source,
            })?;

        let recent_slots =
            RecentLeaderSlots::with_skip_distance(start_slot, config.max_slot_skip_distance);
        let leader_tpu_cache = Arc::new(LeaderTpuCache::load(provider.clone(), start_slot).await?);

        let round_updates = if config.subscribe_slot_updates {
            match provider.subscribe_round_updates().await {
                Ok(round_updates) => round_updates,
                Err(err) => {
                    warn!("Failed to subscribe to slot updates, polling instead: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let t_leader_tpu_service = Some(tokio::spawn(Self::run(
            provider,
            recent_slots.clone(),
            leader_tpu_cache.clone(),
            round_updates,
            config.clone(),
            exit,
        )));

        Ok(LeaderTpuService {
            recent_slots,
            leader_tpu_cache,
            t_leader_tpu_service,
        })
    }

    pub async fn join(&mut self) {
        if let Some(t_handle) = self.t_leader_tpu_service.take() {
            if let Err(err) = t_handle.await {
                error!("Leader TPU service task failed: {}", err);
            }
        }
    }

    pub fn estimated_current_slot(&self) -> Result<Slot> {
        self.recent_slots.estimated_current_slot()
    }

    pub fn recent_slots(&self) -> Vec<Slot> {
        self.recent_slots.observed_slots()
    }

    /// Deduplicated TPU sockets of the next `fanout_slots` cached leaders.
    pub fn unique_leader_tpu_sockets(&self, fanout_slots: u64) -> Vec<SocketAddr> {
        self.leader_tpu_cache.get_unique_leader_sockets(fanout_slots)
    }

    pub fn slot_leader(&self, slot: Slot) -> Option<Pubkey> {
        self.leader_tpu_cache.get_slot_leader(slot)
    }

    pub fn first_slot(&self) -> Slot {
        self.leader_tpu_cache.first_slot()
    }

    pub fn last_slot(&self) -> Slot {
        self.leader_tpu_cache.last_slot()
    }

    async fn run(
        provider: Arc<dyn LedgerStateProvider>,
        recent_slots: RecentLeaderSlots,
        leader_tpu_cache: Arc<LeaderTpuCache>,
        round_updates: Option<UnboundedReceiver<RoundUpdate>>,
        config: TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) {
        tokio::join!(
            Self::run_slot_watcher(
                provider,
                recent_slots.clone(),
                round_updates,
                config.slot_poll_interval,
                exit.clone(),
            ),
            Self::run_cache_refresher(recent_slots, leader_tpu_cache, config, exit),
        );
    }

    async fn run_cache_refresher(
        recent_slots: RecentLeaderSlots,
        leader_tpu_cache: Arc<LeaderTpuCache>,
        config: TpuClientConfig,
        exit: Arc<AtomicBool>,
    ) {
        let mut last_cluster_refresh = Instant::now();
        let mut sleep_duration = config.refresh_interval;

        while !exit.load(Ordering::Relaxed) {
            // Wait a cycle before checking if leader cache needs to be refreshed again
            sleep_unless_exit(sleep_duration, &exit).await;
            if exit.load(Ordering::Relaxed) {
                break;
            }
            sleep_duration = config.refresh_interval;

            let has_error = maybe_refresh_cache(
                &leader_tpu_cache,
                &recent_slots,
                &mut last_cluster_refresh,
                config.cluster_refresh_interval,
            )
            .await;
            if has_error {
                sleep_duration = config.refresh_retry_interval;
            }
        }
    }

    async fn run_slot_watcher(
        provider: Arc<dyn LedgerStateProvider>,
        recent_slots: RecentLeaderSlots,
        round_updates: Option<UnboundedReceiver<RoundUpdate>>,
        poll_interval: Duration,
        exit: Arc<AtomicBool>,
    ) {
        if let Some(mut round_updates) = round_updates {
            while !exit.load(Ordering::Relaxed) {
                match timeout(EXIT_CHECK_INTERVAL, round_updates.recv()).await {
                    Ok(Some(update)) => recent_slots.record_slot(update.next_leader_slot()),
                    Ok(None) => {
                        warn!("Slot update feed closed, polling for the current slot instead");
                        break;
                    }
                    Err(_) => {}
                }
            }
        }

        while !exit.load(Ordering::Relaxed) {
            sleep_unless_exit(poll_interval, &exit).await;
            if exit.load(Ordering::Relaxed) {
                break;
            }
            match provider
                .get_current_slot(CommitmentConfig::processed())
                .await
            {
                Ok(slot) => recent_slots.record_slot(RoundUpdate::started(slot).next_leader_slot()),
                Err(err) => debug!("Failed to poll current slot: {}", err),
            }
        }
    }
}

async fn sleep_unless_exit(duration: Duration, exit: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !exit.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        sleep((deadline - now).min(EXIT_CHECK_INTERVAL)).await;
    }
}

/// One pass of the refresh policy. Returns `true` if any refresh failed, in
/// which case the next pass should come sooner.
async fn maybe_refresh_cache(
    leader_tpu_cache: &LeaderTpuCache,
    recent_slots: &RecentLeaderSlots,
    last_cluster_refresh: &mut Instant,
    cluster_refresh_interval: Duration,
) -> bool {
    let mut has_error = false;

    if last_cluster_refresh.elapsed() > cluster_refresh_interval {
        match leader_tpu_cache.refresh_addresses().await {
            Ok(()) => *last_cluster_refresh = Instant::now(),
            Err(_) => has_error = true,
        }
    }

    let estimated_current_slot = match recent_slots.estimated_current_slot() {
        Ok(slot) => slot,
        Err(err) => {
            error!("Skipping leader cache refresh: {}", err);
            return true;
        }
    };

    let (last_slot, last_epoch_info_slot, slots_in_epoch) = leader_tpu_cache.slot_info();
    if estimated_current_slot >= last_epoch_info_slot.saturating_sub(slots_in_epoch)
        && leader_tpu_cache
            .refresh_epoch_info(estimated_current_slot)
            .await
            .is_err()
    {
        has_error = true;
    }

    if estimated_current_slot >= last_slot.saturating_sub(MAX_FANOUT_SLOTS)
        && leader_tpu_cache
            .refresh_schedule(estimated_current_slot, leader_tpu_cache.slots_in_epoch())
            .await
            .is_err()
    {
        has_error = true;
    }

    has_error
}
