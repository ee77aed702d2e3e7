//! In-memory transports. They keep the state a real device or modem would and record every
//! call, which makes them the transport of choice for tests, benches and simulations.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::{ModemTransport, TrafficCounters, TransportError, TxQueues};

/// A call made on [`MemoryQueues`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    Enable(u16),
    Disable(u16),
    Reset(u16),
    EnableAll,
}

#[derive(Debug)]
struct QueueState {
    enabled: Vec<bool>,
    events: Vec<QueueEvent>,
}

/// A device with a fixed number of transmit queues, all enabled at start.
#[derive(Debug)]
pub struct MemoryQueues {
    state: Mutex<QueueState>,
}

impl MemoryQueues {
    pub fn new(num_queues: usize) -> Self {
        Self {
            state: Mutex::new(QueueState { enabled: vec![true; num_queues], events: Vec::new() }),
        }
    }

    pub fn num_queues(&self) -> usize {
        self.state.lock().enabled.len()
    }

    /// Returns whether the queue is enabled. Out-of-range queues report `false`.
    pub fn is_enabled(&self, index: u16) -> bool {
        self.state.lock().enabled.get(usize::from(index)).copied().unwrap_or(false)
    }

    /// Every call recorded so far, including ignored out-of-range ones.
    pub fn events(&self) -> Vec<QueueEvent> {
        self.state.lock().events.clone()
    }

    /// Returns and clears the recorded calls.
    pub fn take_events(&self) -> Vec<QueueEvent> {
        std::mem::take(&mut self.state.lock().events)
    }

    /// Number of times `event` was recorded.
    pub fn count(&self, event: QueueEvent) -> usize {
        self.state.lock().events.iter().filter(|e| **e == event).count()
    }

    fn record(&self, event: QueueEvent) {
        let mut state = self.state.lock();
        state.events.push(event);

        let (index, enable) = match event {
            QueueEvent::Enable(index) => (index, true),
            QueueEvent::Disable(index) => (index, false),
            QueueEvent::Reset(_) => return,
            QueueEvent::EnableAll => {
                state.enabled.iter_mut().for_each(|q| *q = true);
                return;
            }
        };

        match state.enabled.get_mut(usize::from(index)) {
            Some(q) => *q = enable,
            None => tracing::trace!(index, "ignoring out of range queue"),
        }
    }
}

impl TxQueues for MemoryQueues {
    fn enable_queue(&self, index: u16) {
        self.record(QueueEvent::Enable(index));
    }

    fn disable_queue(&self, index: u16) {
        self.record(QueueEvent::Disable(index));
    }

    fn reset_queue(&self, index: u16) {
        self.record(QueueEvent::Reset(index));
    }

    fn enable_all_queues(&self) {
        self.record(QueueEvent::EnableAll);
    }
}

/// A modem whose traffic counters are advanced by hand.
#[derive(Debug, Default)]
pub struct MemoryModem {
    counters: Mutex<TrafficCounters>,
    reject_suppression: AtomicBool,
    suppression_calls: Mutex<Vec<bool>>,
    queries: Mutex<Vec<usize>>,
}

impl MemoryModem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds packets to the cumulative counters.
    pub fn add_traffic(&self, rx_pkts: u64, tx_pkts: u64) {
        let mut counters = self.counters.lock();
        counters.rx_pkts = counters.rx_pkts.wrapping_add(rx_pkts);
        counters.tx_pkts = counters.tx_pkts.wrapping_add(tx_pkts);
    }

    /// Makes every following [`ModemTransport::set_grant_suppression`] call fail (or succeed).
    pub fn reject_suppression(&self, reject: bool) {
        self.reject_suppression.store(reject, Ordering::SeqCst);
    }

    /// The arguments of every accepted [`ModemTransport::set_grant_suppression`] call.
    pub fn suppression_calls(&self) -> Vec<bool> {
        self.suppression_calls.lock().clone()
    }

    /// The client slots grant queries were sent through, in order.
    pub fn queries(&self) -> Vec<usize> {
        self.queries.lock().clone()
    }
}

impl ModemTransport for MemoryModem {
    fn read_traffic_counters(&self) -> TrafficCounters {
        *self.counters.lock()
    }

    fn set_grant_suppression(&self, suppress: bool) -> Result<(), TransportError> {
        if self.reject_suppression.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(format!("powersave mode {suppress}")));
        }

        self.suppression_calls.lock().push(suppress);
        Ok(())
    }

    fn query_grants(&self, slot: usize) {
        self.queries.lock().push(slot);
    }
}
