pub use solana_tpu_client::tpu_client::{DEFAULT_FANOUT_SLOTS, MAX_FANOUT_SLOTS};
use {
    super::recent_leaders_slot::MAX_SLOT_SKIP_DISTANCE,
    solana_sdk::clock::DEFAULT_MS_PER_SLOT,
    std::time::Duration,
};

/// Default number of attempts per target before it is abandoned.
pub const DEFAULT_RETRY_MAX_COUNT: usize = 2;

/// Refresh cluster TPU ports every 5min in case validators restart with new
/// port configuration or new validators come online.
pub const DEFAULT_CLUSTER_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_MAX_INFLIGHT_DISPATCHES: usize = 1024;

/// Config params for `TpuClient`
#[derive(Clone, Debug)]
pub struct TpuClientConfig {
    /// The range of upcoming slots to include when determining which
    /// leaders to send transactions to (min: 1, max: `MAX_FANOUT_SLOTS`)
    pub fanout_slots: u64,
    /// Attempts per target, first attempt included (min: 1).
    pub retry_max_count: usize,
    /// Pause between attempts to the same target.
    pub retry_delay: Duration,
    /// How long a delivered dispatch keeps its connection open before closing
    /// it, unless cancelled first.
    pub connection_linger: Duration,
    /// Upper bound on concurrently running per-target dispatches.
    pub max_inflight_dispatches: usize,
    /// Cadence of the leader cache refresh loop.
    pub refresh_interval: Duration,
    /// Shortened cadence used right after a failed refresh.
    pub refresh_retry_interval: Duration,
    pub cluster_refresh_interval: Duration,
    pub max_slot_skip_distance: u64,
    /// Follow slot progress over the provider's push feed when it has one.
    pub subscribe_slot_updates: bool,
    /// Polling cadence used when no push feed is available.
    pub slot_poll_interval: Duration,
    pub connect_timeout: Duration,
    pub confirmation_timeout: Duration,
    pub confirmation_poll_interval: Duration,
}

impl Default for TpuClientConfig {
    fn default() -> Self {
        Self {
            fanout_slots: DEFAULT_FANOUT_SLOTS,
            retry_max_count: DEFAULT_RETRY_MAX_COUNT,
            retry_delay: Duration::ZERO,
            connection_linger: Duration::from_secs(2),
            max_inflight_dispatches: DEFAULT_MAX_INFLIGHT_DISPATCHES,
            refresh_interval: Duration::from_secs(1),
            refresh_retry_interval: Duration::from_millis(100),
            cluster_refresh_interval: DEFAULT_CLUSTER_REFRESH_INTERVAL,
            max_slot_skip_distance: MAX_SLOT_SKIP_DISTANCE,
            subscribe_slot_updates: true,
            slot_poll_interval: Duration::from_millis(DEFAULT_MS_PER_SLOT),
            connect_timeout: Duration::from_secs(2),
            confirmation_timeout: Duration::from_secs(30),
            confirmation_poll_interval: Duration::from_millis(500),
        }
    }
}

impl TpuClientConfig {
    /// Sets the fanout from an unchecked (possibly negative) request.
    pub fn with_fanout_slots(mut self, requested: i64) -> Self {
        self.fanout_slots = effective_fanout_slots(requested);
        self
    }

    pub fn with_retry_max_count(mut self, retry_max_count: usize) -> Self {
        self.retry_max_count = retry_max_count.max(1);
        self
    }
}

pub fn effective_fanout_slots(requested: i64) -> u64 {
    requested.clamp(1, MAX_FANOUT_SLOTS as i64) as u64
}

/// Number of leader slots fetched per schedule refresh.
pub fn schedule_fetch_size(slots_in_epoch: u64) -> u64 {
    (2 * MAX_FANOUT_SLOTS).min(slots_in_epoch)
}
