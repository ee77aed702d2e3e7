//! Per-bearer stall watchdog.
//!
//! A bearer's watchdog is armed when the bearer is created and whenever it runs out of grant.
//! If nothing re-arms or stops it within [`WATCHDOG_INTERVAL`], the expiry clears the bearer's
//! in-flight bytes and, if the bearer is still without grant, hands it the default grant and
//! reopens its queues.

use dfc_common::{
    constants::{DEFAULT_GRANT, WATCHDOG_INTERVAL},
    WakeClock,
};
use tracing::debug;

use super::{Bearer, BearerKey, QosContext, Tables};

impl QosContext {
    /// Arms the watchdog of `key` unless it is already armed.
    pub(crate) fn watchdog_arm(&self, tables: &mut Tables, key: BearerKey) {
        let Some(bearer) = tables.bearers.get_mut(key) else {
            return;
        };

        bearer.watchdog.quit = false;
        if bearer.watchdog.started {
            return;
        }
        bearer.watchdog.started = true;

        let ctx = self.this.clone();
        let timer = self.scheduler.schedule_after(
            WATCHDOG_INTERVAL,
            WakeClock::Monotonic,
            Box::new(move || {
                if let Some(ctx) = ctx.upgrade() {
                    ctx.watchdog_expired(key);
                }
            }),
        );

        // The replaced handle, if any, belongs to a timer that already ran or was cancelled.
        bearer.watchdog.timer = Some(timer);
        debug!(mux_id = self.mux_id, bearer_id = bearer.bearer_id, "armed watchdog");
    }

    /// Stops the watchdog without waiting.
    ///
    /// If the expiry is running right now it stays `started` and clears the flag itself once
    /// it observes `quit`.
    pub(crate) fn watchdog_stop(bearer: &mut Bearer) {
        bearer.watchdog.quit = true;
        if !bearer.watchdog.started {
            return;
        }

        let cancelled = bearer.watchdog.timer.as_ref().map_or(true, |timer| timer.try_cancel());
        if cancelled {
            bearer.watchdog.started = false;
            debug!(bearer_id = bearer.bearer_id, "stopped watchdog");
        }
    }

    fn watchdog_expired(&self, key: BearerKey) {
        let mut tables = self.tables.lock();
        // Freed while the expiry was waiting for the lock.
        let Some(bearer) = tables.bearers.get_mut(key) else {
            return;
        };

        if !bearer.watchdog.quit {
            bearer.watchdog.expiries += 1;
            bearer.bytes_in_flight = 0;
            self.stats.increment_watchdog_expiries();

            debug!(
                mux_id = self.mux_id,
                bearer_id = bearer.bearer_id,
                grant = bearer.grant_bytes,
                "watchdog expired"
            );

            if bearer.grant_bytes == 0 {
                bearer.grant_bytes = DEFAULT_GRANT;
                bearer.grant_threshold = self.tunables.grant_threshold(DEFAULT_GRANT);
                self.bearer_flow_ctl(bearer);
            } else {
                bearer.grant_threshold = self.tunables.grant_threshold(bearer.grant_bytes);
            }
        }

        bearer.watchdog.started = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dfc_common::{
        constants::{MAX_MQ_NUM, WATCHDOG_INTERVAL},
        AddressFamily, TokioScheduler,
    };
    use dfc_transport::memory::{MemoryQueues, QueueEvent};
    use tokio::time::sleep;

    use crate::{
        config::{DfcMode, QosOptions, Tunables},
        context::{GrantUpdate, QosContext},
    };

    fn context() -> (Arc<QosContext>, Arc<MemoryQueues>) {
        let queues = Arc::new(MemoryQueues::new(MAX_MQ_NUM));
        let ctx = QosContext::new(
            3,
            queues.clone(),
            Arc::new(TokioScheduler::try_current().unwrap()),
            Arc::new(Tunables::with_mode(DfcMode::FlowId)),
            QosOptions::default(),
        );
        (ctx, queues)
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_on_created_bearer_keeps_grant() {
        let _ = tracing_subscriber::fmt::try_init();
        let (ctx, queues) = context();

        ctx.add_flow(4, 1, AddressFamily::Inet, 2).unwrap();
        assert!(ctx.get_bearer_map(4).unwrap().watchdog_armed);
        queues.take_events();

        sleep(WATCHDOG_INTERVAL + WATCHDOG_INTERVAL / 2).await;

        let bearer = ctx.get_bearer_map(4).unwrap();
        assert_eq!(bearer.watchdog_expiries, 1);
        assert!(!bearer.watchdog_armed);
        assert_eq!(bearer.grant_bytes, 20480);
        assert!(queues.take_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_restores_depleted_grant() {
        let _ = tracing_subscriber::fmt::try_init();
        let (ctx, queues) = context();

        ctx.add_flow(4, 1, AddressFamily::Inet, 2).unwrap();
        sleep(WATCHDOG_INTERVAL * 2).await;

        ctx.burst_check(AddressFamily::Inet, 1, 30_000);
        let bearer = ctx.get_bearer_map(4).unwrap();
        assert_eq!(bearer.grant_bytes, 0);
        assert!(bearer.watchdog_armed);
        assert!(!queues.is_enabled(2));

        sleep(WATCHDOG_INTERVAL * 2).await;

        let bearer = ctx.get_bearer_map(4).unwrap();
        assert_eq!(bearer.grant_bytes, 20480);
        assert_eq!(bearer.bytes_in_flight, 0);
        assert_eq!(bearer.watchdog_expiries, 2);
        assert!(queues.is_enabled(2));
        assert_eq!(queues.count(QueueEvent::Enable(2)), 2);
        assert_eq!(ctx.stats().watchdog_expiries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn grant_stops_watchdog() {
        let (ctx, _queues) = context();

        ctx.add_flow(4, 1, AddressFamily::Inet, 2).unwrap();
        ctx.update_grant(GrantUpdate::new(4, 1000, 1));
        assert!(!ctx.get_bearer_map(4).unwrap().watchdog_armed);

        sleep(WATCHDOG_INTERVAL * 3).await;
        assert_eq!(ctx.stats().watchdog_expiries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn freed_bearer_never_expires() {
        let (ctx, _queues) = context();

        ctx.add_flow(4, 1, AddressFamily::Inet, 2).unwrap();
        ctx.del_flow(4, 1, AddressFamily::Inet);
        ctx.add_flow(4, 1, AddressFamily::Inet, 2).unwrap();

        sleep(WATCHDOG_INTERVAL * 2).await;
        assert_eq!(ctx.stats().watchdog_expiries(), 1);
    }
}
