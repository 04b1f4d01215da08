use {
    super::backend_tpu_client::{Result, TpuSenderError},
    log::*,
    solana_sdk::clock::Slot,
    std::{
        collections::VecDeque,
        sync::{Arc, PoisonError, RwLock},
    },
};

/// Number of recent slot observations kept by the estimator.
// 12 recent slots should be large enough to avoid a misbehaving
// validator from affecting the median recent slot
pub const RECENT_SLOTS_WINDOW: usize = 12;

// 48 chosen because it's unlikely that 12 leaders in a row will miss their slots
pub const MAX_SLOT_SKIP_DISTANCE: u64 = 48;

/// Bounded window of recently observed slots, shared between the slot watcher
/// (the only writer) and the cache refresher.
#[derive(Clone, Debug)]
pub struct RecentLeaderSlots {
    slots: Arc<RwLock<VecDeque<Slot>>>,
    max_skip_distance: u64,
}

impl RecentLeaderSlots {
    pub fn new(current_slot: Slot) -> Self {
        Self::with_skip_distance(current_slot, MAX_SLOT_SKIP_DISTANCE)
    }

    pub fn with_skip_distance(current_slot: Slot, max_skip_distance: u64) -> Self {
        let mut recent_slots = VecDeque::with_capacity(RECENT_SLOTS_WINDOW + 1);
        recent_slots.push_back(current_slot);
        Self {
            slots: Arc::new(RwLock::new(recent_slots)),
            max_skip_distance,
        }
    }

    pub fn record_slot(&self, current_slot: Slot) {
        let mut recent_slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        recent_slots.push_back(current_slot);
        while recent_slots.len() > RECENT_SLOTS_WINDOW {
            recent_slots.pop_front();
        }
    }

    /// Snapshot of the window, oldest observation first.
    pub fn observed_slots(&self) -> Vec<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Estimate the current slot from recent slot notifications.
    ///
    /// The window is sorted and its lower median (`(len - 1) / 2`, rounded
    /// down for even-sized windows) is advanced by the number of observations
    /// above it. The highest observation that does not exceed that expectation
    /// by more than the skip distance wins.
    pub fn estimated_current_slot(&self) -> Result<Slot> {
        let mut recent_slots = self.observed_slots();
        if recent_slots.is_empty() {
            error!("Slot estimate requested before any slot was observed");
            return Err(TpuSenderError::EmptyWindow);
        }
        recent_slots.sort_unstable();

        // Validators can broadcast invalid blocks that are far in the future
        // so check if the current slot is in line with the recent progression.
        let max_index = recent_slots.len() - 1;
        let median_index = max_index / 2;
        let median_recent_slot = recent_slots[median_index];
        let expected_current_slot = median_recent_slot + (max_index - median_index) as u64;
        let max_reasonable_current_slot = expected_current_slot + self.max_skip_distance;

        // The median itself always satisfies the bound, so the search cannot miss.
        Ok(recent_slots
            .into_iter()
            .rev()
            .find(|slot| *slot <= max_reasonable_current_slot)
            .unwrap_or(median_recent_slot))
    }
}

#[cfg(test)]
impl From<Vec<Slot>> for RecentLeaderSlots {
    fn from(recent_slots: Vec<Slot>) -> Self {
        let slots = RecentLeaderSlots {
            slots: Arc::new(RwLock::new(VecDeque::new())),
            max_skip_distance: MAX_SLOT_SKIP_DISTANCE,
        };
        for slot in recent_slots {
            slots.record_slot(slot);
        }
        slots
    }
}
