use std::{
    sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
    time::Duration,
};

use dfc_common::constants::{
    poll_interval, DEFAULT_POLL_FREQUENCY, DEFAULT_SCALE_FACTOR, SURVIVABLE_POLL_INTERVAL,
};

/// The queue-selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DfcMode {
    /// Packets are marked with a flow id and steered to the flow's queue.
    FlowId = 2,
    /// The mark already is the queue index.
    QueueNumber = 3,
    /// Standalone grant mode: every bearer owns a data queue and an ack queue.
    StandaloneGrant = 4,
}

impl DfcMode {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            2 => Some(Self::FlowId),
            3 => Some(Self::QueueNumber),
            4 => Some(Self::StandaloneGrant),
            _ => None,
        }
    }
}

/// Flags carried by a client configuration command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModeFlags(pub u32);

impl ModeFlags {
    pub const MODE_MASK: u32 = 0x000F;
    pub const POWERSAVE: u32 = 0x0010;
    pub const QMAP: u32 = 0x0020;

    /// The requested mode, or `None` if it is not one this engine implements.
    pub const fn mode(self) -> Option<DfcMode> {
        DfcMode::from_raw((self.0 & Self::MODE_MASK) as u8)
    }

    pub const fn powersave(self) -> bool {
        self.0 & Self::POWERSAVE != 0
    }

    pub const fn qmap(self) -> bool {
        self.0 & Self::QMAP != 0
    }
}

/// Process-wide knobs shared by every interface of a port.
///
/// Written by control commands, read on the packet path, so every field is a plain atomic.
#[derive(Debug)]
pub struct Tunables {
    /// Raw [`DfcMode`] value, zero while unconfigured.
    mode: AtomicU8,
    qmap: AtomicBool,
    scale_factor: AtomicU32,
    poll_frequency: AtomicU32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            mode: AtomicU8::new(0),
            qmap: AtomicBool::new(false),
            scale_factor: AtomicU32::new(DEFAULT_SCALE_FACTOR),
            poll_frequency: AtomicU32::new(DEFAULT_POLL_FREQUENCY),
        }
    }
}

impl Tunables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates tunables already configured for `mode`.
    pub fn with_mode(mode: DfcMode) -> Self {
        let tunables = Self::default();
        tunables.set_mode(Some(mode));
        tunables
    }

    #[inline]
    pub fn mode(&self) -> Option<DfcMode> {
        DfcMode::from_raw(self.mode.load(Ordering::Relaxed))
    }

    pub fn set_mode(&self, mode: Option<DfcMode>) {
        self.mode.store(mode.map_or(0, |m| m as u8), Ordering::Relaxed);
    }

    /// Applies the mode and qmap bits of a client configuration command.
    pub fn apply_flags(&self, flags: ModeFlags) {
        self.mode.store((flags.0 & ModeFlags::MODE_MASK) as u8, Ordering::Relaxed);
        self.qmap.store(flags.qmap(), Ordering::Relaxed);
    }

    #[inline]
    pub fn qmap(&self) -> bool {
        self.qmap.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn scale_factor(&self) -> u32 {
        self.scale_factor.load(Ordering::Relaxed)
    }

    /// Sets the grant threshold divisor. Zero is ignored.
    pub fn set_scale_factor(&self, factor: u32) {
        if factor == 0 {
            return;
        }
        self.scale_factor.store(factor, Ordering::Relaxed);
    }

    /// The grant level at which a bearer is considered close to depletion.
    #[inline]
    pub fn grant_threshold(&self, grant: u32) -> u32 {
        grant / self.scale_factor().max(1)
    }

    pub fn poll_frequency(&self) -> u32 {
        self.poll_frequency.load(Ordering::Relaxed)
    }

    pub fn set_poll_frequency(&self, frequency: u32) {
        self.poll_frequency.store(frequency, Ordering::Relaxed);
    }

    /// The plain power-save poll interval.
    pub fn poll_interval(&self) -> Duration {
        poll_interval(self.poll_frequency())
    }
}

/// Capacity limits of a single interface's tables.
#[derive(Debug, Clone)]
pub struct QosOptions {
    /// Maximum number of flows.
    pub max_flows: usize,
    /// Maximum number of live bearers.
    pub max_bearers: usize,
    /// Maximum number of installed filter rules.
    pub max_filters: usize,
}

impl Default for QosOptions {
    fn default() -> Self {
        Self { max_flows: 64, max_bearers: 32, max_filters: 256 }
    }
}

impl QosOptions {
    pub fn max_flows(mut self, max_flows: usize) -> Self {
        self.max_flows = max_flows;
        self
    }

    pub fn max_bearers(mut self, max_bearers: usize) -> Self {
        self.max_bearers = max_bearers;
        self
    }

    pub fn max_filters(mut self, max_filters: usize) -> Self {
        self.max_filters = max_filters;
        self
    }
}

#[derive(Debug, Clone)]
pub struct PowerSaveOptions {
    /// Whether listeners are notified on power-save transitions.
    pub notify: bool,
    /// Interval of the suspend-survivable poll timer.
    pub survivable_interval: Duration,
}

impl Default for PowerSaveOptions {
    fn default() -> Self {
        Self { notify: true, survivable_interval: SURVIVABLE_POLL_INTERVAL }
    }
}

impl PowerSaveOptions {
    /// Enables or disables listener notifications.
    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    /// Sets the interval of the suspend-survivable poll timer.
    pub fn survivable_interval(mut self, interval: Duration) -> Self {
        self.survivable_interval = interval;
        self
    }
}
