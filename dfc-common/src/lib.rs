//! Types shared by every dfc crate: queue and grant constants, address families and the timer
//! abstraction used by bearer watchdogs and the power-save poller.

mod family;
pub use family::AddressFamily;

pub mod timer;
pub use timer::{Scheduler, TimerHandle, TimerTask, TokioScheduler, WakeClock};

pub mod constants {
    use std::time::Duration;

    /// Number of hardware transmit queues tracked by the queue map.
    pub const MAX_MQ_NUM: usize = 16;

    /// The default transmit queue. Not gated by any bearer in standalone-grant mode.
    pub const DEFAULT_MQ_NUM: u16 = 0;

    /// Offset between a bearer's data queue and its ack queue in standalone-grant mode.
    pub const ACK_MQ_OFFSET: u16 = MAX_MQ_NUM as u16 - 1;

    /// Queue that carries unmarked pure TCP acks in flow-id mode.
    pub const DEFAULT_ACK_MQ_NUM: u16 = 1;

    /// Grant (in bytes) given to a bearer on creation, on watchdog recovery and when all flows
    /// are re-enabled.
    pub const DEFAULT_GRANT: u32 = 20480;

    /// Default divisor used to derive a bearer's grant threshold from its grant.
    pub const DEFAULT_SCALE_FACTOR: u32 = 5;

    /// Default power-save poll frequency knob. See [`poll_interval`].
    pub const DEFAULT_POLL_FREQUENCY: u32 = 1000;

    /// Number of grant client slots per port.
    pub const MAX_CLIENT_NUM: usize = 2;

    /// Expiry of the per-bearer stall watchdog.
    pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(50);

    /// Interval of the suspend-survivable power-save timer.
    pub const SURVIVABLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Plain power-save poll interval derived from the frequency knob:
    /// `(freq / 10)` ticks of 10ms, with a floor of one tick when the knob is zero.
    pub const fn poll_interval(frequency: u32) -> Duration {
        let ticks = if frequency == 0 { 1 } else { frequency / 10 };
        Duration::from_millis(ticks as u64 * 10)
    }
}
