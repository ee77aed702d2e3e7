//! Power-save control.
//!
//! A poll task compares the modem's traffic counters between ticks. A tick that sees no
//! traffic asks the modem to stop sending grant indications, reopens every flow and tells the
//! listeners. Outgoing traffic restarts the poll task through [`PowerSave::maybe_restart`] and
//! the next tick leaves power-save again.
//!
//! The poll task reschedules itself on a suspend-survivable timer when the scheduler offers
//! one and on the plain poll interval otherwise. [`PowerSave::stop`] raises a quit flag that
//! every scheduling attempt checks under the timer lock, then cancels the pending timers.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use dfc_common::{Scheduler, TimerHandle, WakeClock};
use dfc_transport::{ModemTransport, TrafficCounters, TransportError};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    client::ClientRegistry,
    config::{PowerSaveOptions, Tunables},
};

mod listener;
pub use listener::{ListenerId, Listeners, PowerSaveListener};

/// The flow state power-save needs from the interfaces of a port.
pub trait FlowGate: Send + Sync + 'static {
    /// Returns `true` if no bearer on any interface is out of grant.
    fn all_flows_enabled(&self) -> bool;

    /// Reinstates the default grant on every interface.
    fn enable_all_flows(&self);
}

#[derive(Debug, Default)]
struct Timers {
    poll: Option<TimerHandle>,
    alarm: Option<TimerHandle>,
}

struct Shared {
    options: PowerSaveOptions,
    tunables: Arc<Tunables>,
    modem: Arc<dyn ModemTransport>,
    gate: Arc<dyn FlowGate>,
    clients: Arc<ClientRegistry>,
    listeners: Arc<Listeners>,
    scheduler: Arc<dyn Scheduler>,

    quit: AtomicBool,
    /// The poll task is scheduled or running.
    work_active: AtomicBool,
    /// Grant suppression is on.
    enabled: AtomicBool,
    ignore_grant: AtomicBool,
    dl_msg_active: AtomicBool,

    /// Counters seen by the previous tick. Held for the whole tick.
    last: Mutex<TrafficCounters>,
    timers: Mutex<Timers>,
}

/// Handle to the power-save poll task of a port.
#[derive(Clone)]
pub struct PowerSave {
    shared: Arc<Shared>,
}

impl PowerSave {
    /// Records the current traffic counters and schedules the first tick one poll interval
    /// from now.
    pub fn start(
        options: PowerSaveOptions,
        tunables: Arc<Tunables>,
        modem: Arc<dyn ModemTransport>,
        gate: Arc<dyn FlowGate>,
        clients: Arc<ClientRegistry>,
        listeners: Arc<Listeners>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let baseline = modem.read_traffic_counters();
        let shared = Arc::new(Shared {
            options,
            tunables,
            modem,
            gate,
            clients,
            listeners,
            scheduler,
            quit: AtomicBool::new(false),
            work_active: AtomicBool::new(true),
            enabled: AtomicBool::new(false),
            ignore_grant: AtomicBool::new(false),
            dl_msg_active: AtomicBool::new(false),
            last: Mutex::new(baseline),
            timers: Mutex::new(Timers::default()),
        });

        let interval = shared.tunables.poll_interval();
        shared.schedule(WakeClock::Monotonic, interval);
        debug!(?interval, "powersave poll started");

        Self { shared }
    }

    /// Stops the poll task and waits for a tick in progress to finish.
    ///
    /// Must not be called from a [`PowerSaveListener`] callback.
    pub fn stop(&self) {
        let shared = &self.shared;
        shared.quit.store(true, Ordering::SeqCst);

        let (poll, alarm) = {
            let mut timers = shared.timers.lock();
            (timers.poll.take(), timers.alarm.take())
        };

        for timer in [alarm, poll].into_iter().flatten() {
            timer.cancel_sync();
        }

        shared.work_active.store(false, Ordering::SeqCst);
        debug!("powersave poll stopped");
    }

    /// Waits for a tick in progress to finish.
    pub fn flush(&self) {
        drop(self.shared.last.lock());
    }

    /// Restarts the poll task if it went idle after entering power-save. Cheap enough to
    /// call for every transmitted packet.
    pub fn maybe_restart(&self) {
        let shared = &self.shared;
        if shared.work_active.load(Ordering::Acquire) {
            return;
        }

        if !shared.work_active.swap(true, Ordering::SeqCst) {
            trace!("restarting powersave poll");
            shared.schedule(WakeClock::Monotonic, Duration::ZERO);
        }
    }

    /// Records downlink activity since the last tick.
    pub fn set_dl_msg_active(&self) {
        self.shared.dl_msg_active.store(true, Ordering::Release);
    }

    /// Returns `true` while grant indications must be dropped.
    pub fn ignore_grant(&self) -> bool {
        self.shared.ignore_grant.load(Ordering::Acquire)
    }

    /// Returns `true` while the port is in power-save.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Returns `true` while the poll task is scheduled or running.
    pub fn is_active(&self) -> bool {
        self.shared.work_active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for PowerSave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerSave")
            .field("enabled", &self.is_enabled())
            .field("active", &self.is_active())
            .field("quit", &self.shared.quit.load(Ordering::Relaxed))
            .finish()
    }
}

impl Shared {
    fn schedule(self: &Arc<Self>, clock: WakeClock, delay: Duration) {
        let mut timers = self.timers.lock();
        // `stop` raises the flag before taking the timer lock.
        if self.quit.load(Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        match clock {
            WakeClock::Monotonic => {
                if timers.poll.as_ref().map_or(false, TimerHandle::is_pending) {
                    return;
                }

                let task = Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.check_stats();
                    }
                });
                timers.poll = Some(self.scheduler.schedule_after(delay, clock, task));
            }
            WakeClock::Suspend => {
                if let Some(alarm) = timers.alarm.take() {
                    alarm.try_cancel();
                }

                // The alarm only kicks the poll task.
                let task = Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.schedule(WakeClock::Monotonic, Duration::ZERO);
                    }
                });
                timers.alarm = Some(self.scheduler.schedule_after(delay, clock, task));
            }
        }
    }

    fn reschedule(self: &Arc<Self>, survivable: bool) {
        if survivable && self.scheduler.supports_suspend_clock() {
            self.schedule(WakeClock::Suspend, self.options.survivable_interval);
        } else {
            self.schedule(WakeClock::Monotonic, self.tunables.poll_interval());
        }
    }

    fn set_suppression(&self, suppress: bool) -> Result<(), TransportError> {
        if !self.clients.has_powersave_client() {
            return Err(TransportError::NoClient);
        }
        self.modem.set_grant_suppression(suppress)
    }

    fn check_stats(self: &Arc<Self>) {
        let mut last = self.last.lock();
        if self.quit.load(Ordering::SeqCst) {
            return;
        }

        if self.enabled.load(Ordering::Acquire) {
            self.resume();
            self.reschedule(true);
            return;
        }

        let now = self.modem.read_traffic_counters();
        let rx = now.rx_pkts.wrapping_sub(last.rx_pkts);
        let tx = now.tx_pkts.wrapping_sub(last.tx_pkts);
        *last = now;

        let dl_msg_active = self.dl_msg_active.swap(false, Ordering::AcqRel);

        if rx != 0 || tx != 0 {
            trace!(rx, tx, "traffic since last poll");
            self.reschedule(true);
            return;
        }

        // Flows held down without downlink activity usually mean a radio link failure, which
        // power-save would only prolong.
        if !dl_msg_active && !self.gate.all_flows_enabled() {
            trace!("flows disabled, staying out of powersave");
            self.reschedule(false);
            return;
        }

        if let Err(e) = self.set_suppression(true) {
            warn!(?e, "failed to enter powersave");
            self.reschedule(true);
            return;
        }

        self.enabled.store(true, Ordering::Release);
        self.ignore_grant.store(true, Ordering::Release);
        self.work_active.store(false, Ordering::SeqCst);

        self.gate.enable_all_flows();
        if self.options.notify {
            self.listeners.notify_enter();
        }
        info!("entered powersave");
    }

    fn resume(&self) {
        self.ignore_grant.store(false, Ordering::Release);

        if let Err(e) = self.set_suppression(false) {
            warn!(?e, "failed to leave powersave");
            return;
        }

        self.enabled.store(false, Ordering::Release);
        if !self.tunables.qmap() {
            self.clients.query_grants(&*self.modem);
        }
        if self.options.notify {
            self.listeners.notify_exit();
        }
        info!("exited powersave");
    }
}
