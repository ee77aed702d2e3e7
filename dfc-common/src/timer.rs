//! One-shot timers behind a small scheduling trait.
//!
//! Bearer watchdogs and the power-save poller never touch a runtime directly. They ask a
//! [`Scheduler`] to run a closure after a delay and keep the returned [`TimerHandle`], which
//! gives them the two operations they need to tear down safely:
//!
//! * [`TimerHandle::try_cancel`], a non-blocking cancel that reports whether the callback can
//!   still run. Safe to call while holding a lock the callback itself takes.
//! * [`TimerHandle::cancel_sync`], which additionally waits for a callback that is already
//!   executing on another thread. Must be called without holding any lock the callback takes.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{runtime::Handle, task::AbortHandle};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// The closure run when a timer expires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// The clock a timer is armed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeClock {
    /// Plain interval timer. Stops counting while the system is suspended.
    Monotonic,
    /// Alarm-style timer that keeps counting across suspend.
    Suspend,
}

/// Arms one-shot timers.
pub trait Scheduler: Send + Sync + 'static {
    /// Runs `task` once after `delay` has elapsed on `clock`.
    fn schedule_after(&self, delay: Duration, clock: WakeClock, task: TimerTask) -> TimerHandle;

    /// Whether [`WakeClock::Suspend`] is backed by a suspend-survivable clock. Callers that
    /// prefer the survivable clock fall back to [`WakeClock::Monotonic`] when this is `false`.
    fn supports_suspend_clock(&self) -> bool {
        false
    }
}

struct TimerState {
    status: AtomicU8,
    abort: Mutex<Option<AbortHandle>>,
}

/// Handle to an armed timer. Cloning the handle does not duplicate the timer.
#[derive(Clone)]
pub struct TimerHandle {
    inner: Arc<TimerState>,
}

impl TimerHandle {
    /// Creates a handle in the pending state. Used by [`Scheduler`] implementations, which
    /// must call [`TimerHandle::fire`] when the timer expires.
    pub fn pending() -> Self {
        Self {
            inner: Arc::new(TimerState { status: AtomicU8::new(PENDING), abort: Mutex::new(None) }),
        }
    }

    /// Attaches the runtime task backing this timer so cancellation can also drop it.
    pub fn set_abort(&self, abort: AbortHandle) {
        *self.inner.abort.lock() = Some(abort);
        // Cancelled before the task was attached.
        if self.inner.status.load(Ordering::Acquire) == CANCELLED {
            if let Some(abort) = self.inner.abort.lock().take() {
                abort.abort();
            }
        }
    }

    /// Runs `task` unless the timer was cancelled first.
    pub fn fire(&self, task: TimerTask) {
        if self
            .inner
            .status
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        task();
        self.inner.status.store(DONE, Ordering::Release);
    }

    /// Attempts to cancel the timer without blocking.
    ///
    /// Returns `true` when the callback is guaranteed not to run (or has already finished), and
    /// `false` when it is executing right now.
    pub fn try_cancel(&self) -> bool {
        match self.inner.status.compare_exchange(
            PENDING,
            CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if let Some(abort) = self.inner.abort.lock().take() {
                    abort.abort();
                }
                true
            }
            Err(RUNNING) => false,
            Err(_) => true,
        }
    }

    /// Cancels the timer, waiting for a callback that is currently executing to return.
    pub fn cancel_sync(&self) {
        while !self.try_cancel() {
            std::thread::yield_now();
        }
    }

    /// Returns `true` if the timer is armed and has not started running.
    pub fn is_pending(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) == PENDING
    }

    /// Returns `true` if the callback is executing right now.
    pub fn is_running(&self) -> bool {
        self.inner.status.load(Ordering::Acquire) == RUNNING
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.inner.status.load(Ordering::Acquire) {
            PENDING => "pending",
            RUNNING => "running",
            DONE => "done",
            _ => "cancelled",
        };
        f.debug_struct("TimerHandle").field("status", &status).finish()
    }
}

/// A [`Scheduler`] that spawns a sleeping task per timer on a Tokio runtime.
///
/// Tokio's timer wheel runs on the monotonic clock, so [`WakeClock::Suspend`] is only honored
/// when the scheduler was built with [`TokioScheduler::with_suspend_clock`] on a platform where
/// the runtime clock keeps counting across suspend.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
    suspend_clock: bool,
}

impl TokioScheduler {
    /// Creates a scheduler that spawns onto the given runtime.
    pub fn new(handle: Handle) -> Self {
        Self { handle, suspend_clock: false }
    }

    /// Creates a scheduler on the runtime of the calling context, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    /// Declares that the runtime clock survives suspend.
    pub fn with_suspend_clock(mut self, enabled: bool) -> Self {
        self.suspend_clock = enabled;
        self
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, clock: WakeClock, task: TimerTask) -> TimerHandle {
        if clock == WakeClock::Suspend && !self.suspend_clock {
            tracing::trace!(?delay, "suspend clock unavailable, arming monotonic timer");
        }

        let timer = TimerHandle::pending();
        let fired = timer.clone();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            fired.fire(task);
        });
        timer.set_abort(join.abort_handle());

        timer
    }

    fn supports_suspend_clock(&self) -> bool {
        self.suspend_clock
    }
}
