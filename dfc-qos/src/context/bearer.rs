use dfc_common::{constants::DEFAULT_GRANT, TimerHandle};
use rustc_hash::FxHashMap;

/// Generation-checked handle to a bearer slot.
///
/// Timers and flows refer to bearers through keys, never references. A key whose bearer was
/// freed stops resolving even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BearerKey {
    index: u32,
    generation: u32,
}

/// Stall watchdog bookkeeping of a bearer.
#[derive(Debug, Default)]
pub(crate) struct Watchdog {
    pub(crate) timer: Option<TimerHandle>,
    /// A timer is armed or its callback is about to run.
    pub(crate) started: bool,
    /// The bearer is being torn down. Expiries only clear `started`.
    pub(crate) quit: bool,
    pub(crate) expiries: u64,
}

/// A radio-level bearer and its grant state.
#[derive(Debug)]
pub(crate) struct Bearer {
    pub(crate) bearer_id: u8,
    /// Number of flows bound to this bearer.
    pub(crate) flow_refs: u32,
    pub(crate) grant_bytes: u32,
    pub(crate) grant_threshold: u32,
    pub(crate) queue_index: Option<u16>,
    pub(crate) ack_queue_index: Option<u16>,
    pub(crate) sequence: u32,
    pub(crate) ack_required: bool,
    pub(crate) bytes_in_flight: u64,
    pub(crate) tcp_bidirectional: bool,
    pub(crate) rat_switch_pending: bool,
    pub(crate) tx_off: bool,
    pub(crate) watchdog: Watchdog,
}

impl Bearer {
    pub(crate) fn new(bearer_id: u8, grant_threshold: u32) -> Self {
        Self {
            bearer_id,
            flow_refs: 0,
            grant_bytes: DEFAULT_GRANT,
            grant_threshold,
            queue_index: None,
            ack_queue_index: None,
            sequence: 0,
            ack_required: false,
            bytes_in_flight: 0,
            tcp_bidirectional: false,
            rat_switch_pending: false,
            tx_off: false,
            watchdog: Watchdog::default(),
        }
    }

    pub(crate) fn snapshot(&self) -> BearerMap {
        BearerMap {
            bearer_id: self.bearer_id,
            flow_refs: self.flow_refs,
            grant_bytes: self.grant_bytes,
            grant_threshold: self.grant_threshold,
            queue_index: self.queue_index,
            ack_queue_index: self.ack_queue_index,
            sequence: self.sequence,
            ack_required: self.ack_required,
            bytes_in_flight: self.bytes_in_flight,
            tcp_bidirectional: self.tcp_bidirectional,
            rat_switch_pending: self.rat_switch_pending,
            tx_off: self.tx_off,
            watchdog_armed: self.watchdog.started,
            watchdog_expiries: self.watchdog.expiries,
        }
    }
}

/// A point-in-time copy of a bearer's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerMap {
    pub bearer_id: u8,
    pub flow_refs: u32,
    pub grant_bytes: u32,
    pub grant_threshold: u32,
    pub queue_index: Option<u16>,
    pub ack_queue_index: Option<u16>,
    pub sequence: u32,
    pub ack_required: bool,
    pub bytes_in_flight: u64,
    pub tcp_bidirectional: bool,
    pub rat_switch_pending: bool,
    pub tx_off: bool,
    pub watchdog_armed: bool,
    pub watchdog_expiries: u64,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    bearer: Option<Bearer>,
}

/// Bearer storage.
///
/// A bearer is first *linked* (reachable by id) and later *unlinked* when its last flow goes
/// away. An unlinked bearer keeps its slot until [`BearerArena::remove`] frees it, so timers
/// holding its key still resolve it in between.
#[derive(Debug, Default)]
pub(crate) struct BearerArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_id: FxHashMap<u8, BearerKey>,
}

impl BearerArena {
    /// Number of linked bearers.
    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn lookup(&self, bearer_id: u8) -> Option<BearerKey> {
        self.by_id.get(&bearer_id).copied()
    }

    pub(crate) fn get(&self, key: BearerKey) -> Option<&Bearer> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.bearer.as_ref())
    }

    pub(crate) fn get_mut(&mut self, key: BearerKey) -> Option<&mut Bearer> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.bearer.as_mut())
    }

    pub(crate) fn by_id(&self, bearer_id: u8) -> Option<&Bearer> {
        self.lookup(bearer_id).and_then(|key| self.get(key))
    }

    /// Stores and links a new bearer.
    pub(crate) fn insert(&mut self, bearer: Bearer) -> BearerKey {
        let bearer_id = bearer.bearer_id;
        let key = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.bearer = Some(bearer);
                BearerKey { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, bearer: Some(bearer) });
                BearerKey { index, generation: 0 }
            }
        };

        self.by_id.insert(bearer_id, key);
        key
    }

    /// Makes the bearer unreachable by id. Its slot stays occupied.
    pub(crate) fn unlink(&mut self, key: BearerKey) {
        if let Some(bearer_id) = self.get(key).map(|b| b.bearer_id) {
            if self.by_id.get(&bearer_id) == Some(&key) {
                self.by_id.remove(&bearer_id);
            }
        }
    }

    /// Frees the slot, invalidating every outstanding key to it.
    pub(crate) fn remove(&mut self, key: BearerKey) -> Option<Bearer> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }

        let bearer = slot.bearer.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);

        if self.by_id.get(&bearer.bearer_id) == Some(&key) {
            self.by_id.remove(&bearer.bearer_id);
        }

        Some(bearer)
    }

    /// Keys of every linked bearer.
    pub(crate) fn keys(&self) -> Vec<BearerKey> {
        self.by_id.values().copied().collect()
    }

    /// Iterates over the linked bearers.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Bearer> + '_ {
        self.by_id.values().filter_map(|key| self.get(*key))
    }

    /// Frees every slot, linked or not.
    pub(crate) fn drain(&mut self) -> Vec<Bearer> {
        self.by_id.clear();
        self.free.clear();
        self.slots.drain(..).filter_map(|slot| slot.bearer).collect()
    }
}
