//! The collaborators the flow-control core drives but does not own: the network device's
//! transmit queues and the modem control transport.

use std::io;

use thiserror::Error;

pub mod memory;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Request rejected by modem: {0}")]
    Rejected(String),
    #[error("No power-save client registered")]
    NoClient,
}

/// Control over the transmit queues of a network device.
///
/// Every method must be callable from any context and must not block: the core invokes them
/// while holding its table lock. Indices beyond the device's queue count are ignored.
pub trait TxQueues: Send + Sync + 'static {
    /// Wakes a stopped transmit queue.
    fn enable_queue(&self, index: u16);

    /// Stops a transmit queue.
    fn disable_queue(&self, index: u16);

    /// Drops all packets pending on a transmit queue.
    fn reset_queue(&self, index: u16);

    /// Wakes every transmit queue of the device.
    fn enable_all_queues(&self);

    /// Enables or disables a queue.
    fn set_queue_enabled(&self, index: u16, enable: bool) {
        if enable {
            self.enable_queue(index);
        } else {
            self.disable_queue(index);
        }
    }
}

/// Cumulative packet counters of the physical transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub rx_pkts: u64,
    pub tx_pkts: u64,
}

/// The modem side of the control plane, as seen by the power-save poller.
pub trait ModemTransport: Send + Sync + 'static {
    /// Reads the cumulative rx/tx packet counters.
    fn read_traffic_counters(&self) -> TrafficCounters;

    /// Asks the modem to stop (`true`) or resume (`false`) sending grant and downlink marker
    /// indications.
    fn set_grant_suppression(&self, suppress: bool) -> Result<(), TransportError>;

    /// Requests a fresh grant report through the grant client in `slot`.
    fn query_grants(&self, slot: usize);
}
