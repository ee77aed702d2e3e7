//! Per-interface flow control state.
//!
//! A [`QosContext`] owns the flow table, the bearers flows are bound to, the queue map and the
//! filter list of one virtual interface. All of it lives behind a single table lock that is
//! only ever held for short, non-blocking sections: control commands, per-packet lookups and
//! watchdog expiries.
//!
//! Control commands are additionally serialized by a control lock. A command that drops the
//! last flow of a bearer parks the bearer in a single pending-removal slot, releases the table
//! lock, waits for the bearer's watchdog callback to finish and only then frees it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Weak,
};

use dfc_common::{
    constants::{ACK_MQ_OFFSET, DEFAULT_GRANT, DEFAULT_MQ_NUM, MAX_MQ_NUM},
    AddressFamily, Scheduler,
};
use dfc_transport::TxQueues;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{
    config::{DfcMode, QosOptions, Tunables},
    filter::{FilterId, FilterRule, FilterSpec},
    stats::QosStats,
    QosError,
};

mod bearer;
pub(crate) use bearer::{Bearer, BearerArena, BearerKey};
pub use bearer::BearerMap;

mod flow;
pub(crate) use flow::Flow;
pub use flow::{FlowKey, FlowMap};

mod grant;
pub use grant::GrantUpdate;

mod select;
mod watchdog;

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) flows: FxHashMap<FlowKey, Flow>,
    pub(crate) bearers: BearerArena,
    /// Installed rules in match order: ascending precedence, insertion order within ties.
    pub(crate) filters: Vec<FilterRule>,
    /// The bearer gating each transmit queue.
    pub(crate) queue_map: [Option<BearerKey>; MAX_MQ_NUM],
    /// An unlinked bearer waiting for its watchdog to quiesce.
    pub(crate) pending_removal: Option<BearerKey>,
    next_filter_id: u64,
}

/// Flow control state of a single virtual interface.
pub struct QosContext {
    mux_id: u8,
    /// Serializes control commands, including the deferred bearer release that follows them.
    control: Mutex<()>,
    tables: Mutex<Tables>,
    /// Mirrors `tables.filters.len()` so packets skip the lock when nothing is installed.
    num_filters: AtomicUsize,
    queues: Arc<dyn TxQueues>,
    scheduler: Arc<dyn Scheduler>,
    tunables: Arc<Tunables>,
    options: QosOptions,
    stats: QosStats,
    this: Weak<QosContext>,
}

impl QosContext {
    /// Creates the context of interface `mux_id`.
    pub fn new(
        mux_id: u8,
        queues: Arc<dyn TxQueues>,
        scheduler: Arc<dyn Scheduler>,
        tunables: Arc<Tunables>,
        options: QosOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            mux_id,
            control: Mutex::new(()),
            tables: Mutex::new(Tables::default()),
            num_filters: AtomicUsize::new(0),
            queues,
            scheduler,
            tunables,
            options,
            stats: QosStats::default(),
            this: this.clone(),
        })
    }

    /// The mux id of the interface.
    #[inline]
    pub fn mux_id(&self) -> u8 {
        self.mux_id
    }

    /// Classification and watchdog counters.
    #[inline]
    pub fn stats(&self) -> &QosStats {
        &self.stats
    }

    /// The port-wide knobs this context reads.
    #[inline]
    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    /// Number of installed filter rules.
    #[inline]
    pub fn num_filters(&self) -> usize {
        self.num_filters.load(Ordering::Acquire)
    }

    /// Binds flow `(flow_id, family)` to `bearer_id` and transmit queue `queue_index`.
    ///
    /// Re-adding an identical flow is a no-op. A flow that moves to another bearer is rebound,
    /// and a flow that only changes queue is replaced.
    pub fn add_flow(
        &self,
        bearer_id: u8,
        flow_id: u32,
        family: AddressFamily,
        queue_index: u16,
    ) -> Result<(), QosError> {
        if usize::from(queue_index) >= MAX_MQ_NUM {
            return Err(QosError::InvalidArgument(format!(
                "queue index {queue_index} out of range (max {})",
                MAX_MQ_NUM - 1
            )));
        }

        let _control = self.control.lock();
        let key = FlowKey::new(flow_id, family);

        let result = loop {
            let mut tables = self.tables.lock();
            let existing = tables.flows.get(&key).map(|flow| (flow.bearer_id, flow.queue_index));

            match existing {
                Some((current, _)) if current != bearer_id => {
                    break self.rebind_flow(&mut tables, key, bearer_id, queue_index);
                }
                Some((current, queue)) if queue != queue_index => {
                    drop(tables);
                    // The old binding is gone once this returns, so the next pass creates it.
                    self.remove_flow(current, key);
                }
                Some(_) => break Ok(()),
                None => break self.create_flow(&mut tables, key, bearer_id, queue_index),
            }
        };

        self.drain_removed();
        result
    }

    /// Removes flow `(flow_id, family)` together with its filter rules. Unknown flows are
    /// ignored. Once the flow table is empty every transmit queue is re-enabled.
    pub fn del_flow(&self, bearer_id: u8, flow_id: u32, family: AddressFamily) {
        let _control = self.control.lock();
        self.remove_flow(bearer_id, FlowKey::new(flow_id, family));
    }

    /// Removes a flow and releases its bearer. Requires the control lock.
    fn remove_flow(&self, bearer_id: u8, key: FlowKey) {
        {
            let mut tables = self.tables.lock();

            match tables.flows.remove(&key) {
                Some(flow) => {
                    debug!(
                        mux_id = self.mux_id,
                        bearer_id = flow.bearer_id,
                        flow_id = key.flow_id,
                        family = %key.family,
                        queue = flow.queue_index,
                        "removed flow"
                    );
                    self.bearer_put(&mut tables, flow.bearer, true);
                    self.purge_filters(&mut tables, &flow.filters);
                }
                None => {
                    debug!(mux_id = self.mux_id, bearer_id, flow_id = key.flow_id, "unknown flow");
                }
            }

            if tables.flows.is_empty() {
                trace!(mux_id = self.mux_id, "no flows left, enabling all queues");
                self.queues.enable_all_queues();
            }
        }

        self.drain_removed();
    }

    fn create_flow(
        &self,
        tables: &mut Tables,
        key: FlowKey,
        bearer_id: u8,
        queue_index: u16,
    ) -> Result<(), QosError> {
        if tables.flows.len() >= self.options.max_flows {
            return Err(QosError::ResourceExhausted("flow table"));
        }

        if tables.bearers.lookup(bearer_id).is_none() &&
            tables.bearers.len() >= self.options.max_bearers
        {
            return Err(QosError::ResourceExhausted("bearer table"));
        }

        let bearer = self.bearer_get(tables, bearer_id);
        tables.flows.insert(key, Flow { bearer_id, queue_index, bearer, filters: Vec::new() });

        debug!(
            mux_id = self.mux_id,
            bearer_id,
            flow_id = key.flow_id,
            family = %key.family,
            queue = queue_index,
            "added flow"
        );

        self.update_mq(tables, bearer, key.family, queue_index);
        Ok(())
    }

    fn rebind_flow(
        &self,
        tables: &mut Tables,
        key: FlowKey,
        bearer_id: u8,
        queue_index: u16,
    ) -> Result<(), QosError> {
        let Some(old) = tables.flows.get(&key).map(|flow| flow.bearer) else {
            return Ok(());
        };

        // Releasing the old bearer frees a slot only if this flow was its last reference.
        let frees_slot = tables.bearers.get(old).map_or(false, |b| b.flow_refs <= 1);
        if tables.bearers.lookup(bearer_id).is_none() &&
            tables.bearers.len() >= self.options.max_bearers &&
            !frees_slot
        {
            return Err(QosError::ResourceExhausted("bearer table"));
        }

        self.bearer_put(tables, old, false);
        let bearer = self.bearer_get(tables, bearer_id);

        if let Some(flow) = tables.flows.get_mut(&key) {
            debug!(
                mux_id = self.mux_id,
                from = flow.bearer_id,
                to = bearer_id,
                flow_id = key.flow_id,
                family = %key.family,
                queue = queue_index,
                "rebound flow"
            );
            flow.bearer_id = bearer_id;
            flow.queue_index = queue_index;
            flow.bearer = bearer;
        }

        self.update_mq(tables, bearer, key.family, queue_index);
        Ok(())
    }

    /// Takes a flow reference on `bearer_id`, creating the bearer on first use.
    fn bearer_get(&self, tables: &mut Tables, bearer_id: u8) -> BearerKey {
        if let Some(key) = tables.bearers.lookup(bearer_id) {
            if let Some(bearer) = tables.bearers.get_mut(key) {
                bearer.flow_refs += 1;
            }
            return key;
        }

        let mut bearer = Bearer::new(bearer_id, self.tunables.grant_threshold(DEFAULT_GRANT));
        bearer.flow_refs = 1;
        let key = tables.bearers.insert(bearer);
        debug!(mux_id = self.mux_id, bearer_id, "created bearer");

        self.watchdog_arm(tables, key);
        key
    }

    /// Drops a flow reference. The last reference clears the bearer's queue map entries,
    /// optionally flushing and re-enabling those queues, and parks the bearer for removal.
    fn bearer_put(&self, tables: &mut Tables, key: BearerKey, reset: bool) {
        let Some(bearer) = tables.bearers.get_mut(key) else {
            return;
        };

        bearer.flow_refs = bearer.flow_refs.saturating_sub(1);
        if bearer.flow_refs > 0 {
            return;
        }

        let bearer_id = bearer.bearer_id;
        Self::watchdog_stop(bearer);

        let standalone = self.tunables.mode() == Some(DfcMode::StandaloneGrant);
        for (index, slot) in tables.queue_map.iter_mut().enumerate() {
            if *slot != Some(key) {
                continue;
            }

            *slot = None;
            if reset {
                let index = index as u16;
                self.reset_queue(index);
                if standalone {
                    self.reset_queue(index + ACK_MQ_OFFSET);
                }
            }
        }

        tables.bearers.unlink(key);
        assert!(
            tables.pending_removal.is_none(),
            "bearer {bearer_id} released while another bearer awaits removal"
        );
        tables.pending_removal = Some(key);
        debug!(mux_id = self.mux_id, bearer_id, "released bearer");
    }

    fn reset_queue(&self, index: u16) {
        trace!(mux_id = self.mux_id, queue = index, "reset queue");
        self.queues.reset_queue(index);
        self.queues.enable_queue(index);
    }

    /// Claims the flow's queue for its bearer if no bearer gates it yet.
    fn update_mq(&self, tables: &mut Tables, key: BearerKey, family: AddressFamily, queue: u16) {
        let standalone = self.tunables.mode() == Some(DfcMode::StandaloneGrant);
        if standalone && queue == DEFAULT_MQ_NUM {
            return;
        }

        let slot = &mut tables.queue_map[usize::from(queue)];
        if slot.is_some() {
            return;
        }

        let Some(bearer) = tables.bearers.get_mut(key) else {
            return;
        };
        *slot = Some(key);

        if standalone {
            bearer.queue_index = Some(queue);
            bearer.ack_queue_index = Some(queue + ACK_MQ_OFFSET);
        } else if family.is_ancillary() {
            bearer.ack_queue_index = Some(queue);
        } else {
            bearer.queue_index = Some(queue);
        }

        let enable = bearer.grant_bytes > 0;
        trace!(mux_id = self.mux_id, bearer_id = bearer.bearer_id, queue, enable, "mapped queue");
        self.queues.set_queue_enabled(queue, enable);
        if standalone {
            self.queues.set_queue_enabled(queue + ACK_MQ_OFFSET, enable);
        }
    }

    /// Opens or closes a bearer's queues according to its grant. The ack queue stays open
    /// while the bearer carries bidirectional TCP.
    pub(crate) fn bearer_flow_ctl(&self, bearer: &Bearer) {
        let enable = bearer.grant_bytes > 0;

        if let Some(queue) = bearer.queue_index {
            trace!(
                mux_id = self.mux_id,
                bearer_id = bearer.bearer_id,
                queue,
                enable,
                "flow control"
            );
            self.queues.set_queue_enabled(queue, enable);
        }

        if let Some(ack) = bearer.ack_queue_index {
            if enable || !bearer.tcp_bidirectional {
                self.queues.set_queue_enabled(ack, enable);
            }
        }
    }

    /// Frees the bearer parked by the last command, once its watchdog can no longer run.
    /// Must not be called with the table lock held.
    fn drain_removed(&self) {
        let removed = {
            let mut tables = self.tables.lock();
            match tables.pending_removal.take() {
                Some(key) => tables.bearers.remove(key),
                None => None,
            }
        };

        if let Some(bearer) = removed {
            if let Some(timer) = &bearer.watchdog.timer {
                timer.cancel_sync();
            }
            debug!(mux_id = self.mux_id, bearer_id = bearer.bearer_id, "freed bearer");
        }
    }

    /// Installs a filter rule for flow `(flow_id, family)`.
    ///
    /// Malformed rules are rejected. Rules for unknown flows are discarded. A rule goes after
    /// every installed rule of equal precedence, so ties match in install order.
    pub fn add_filter(
        &self,
        flow_id: u32,
        family: AddressFamily,
        spec: &FilterSpec,
    ) -> Result<(), QosError> {
        let key = FlowKey::new(flow_id, family);
        let _control = self.control.lock();
        let mut tables = self.tables.lock();

        let id = FilterId(tables.next_filter_id);
        let rule = FilterRule::new(id, key, spec)?;

        if !tables.flows.contains_key(&key) {
            debug!(mux_id = self.mux_id, flow_id, %family, "discarding filter for unknown flow");
            return Ok(());
        }

        if tables.filters.len() >= self.options.max_filters {
            return Err(QosError::ResourceExhausted("filter table"));
        }

        tables.next_filter_id += 1;
        if let Some(flow) = tables.flows.get_mut(&key) {
            flow.filters.push(id);
        }

        let precedence = rule.precedence;
        let at = tables.filters.partition_point(|r| r.precedence <= precedence);
        tables.filters.insert(at, rule);
        self.num_filters.fetch_add(1, Ordering::Release);

        debug!(mux_id = self.mux_id, flow_id, %family, precedence, "installed filter");
        Ok(())
    }

    /// Removes every filter rule of flow `(flow_id, family)`.
    pub fn remove_filter(&self, flow_id: u32, family: AddressFamily) {
        let key = FlowKey::new(flow_id, family);
        let _control = self.control.lock();
        let mut tables = self.tables.lock();

        let ids = match tables.flows.get_mut(&key) {
            Some(flow) => std::mem::take(&mut flow.filters),
            None => {
                debug!(mux_id = self.mux_id, flow_id, %family, "no filters to remove");
                return;
            }
        };

        self.purge_filters(&mut tables, &ids);
    }

    fn purge_filters(&self, tables: &mut Tables, ids: &[FilterId]) {
        if ids.is_empty() {
            return;
        }

        let before = tables.filters.len();
        tables.filters.retain(|rule| !ids.contains(&rule.id));
        let removed = before - tables.filters.len();

        let _ = self.num_filters.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            Some(n.saturating_sub(removed))
        });
        debug!(mux_id = self.mux_id, removed, "removed filters");
    }

    /// Returns a copy of flow `(flow_id, family)`.
    pub fn get_flow_map(&self, flow_id: u32, family: AddressFamily) -> Option<FlowMap> {
        let key = FlowKey::new(flow_id, family);
        self.tables.lock().flows.get(&key).map(|flow| flow.snapshot(key))
    }

    /// Returns a copy of bearer `bearer_id`.
    pub fn get_bearer_map(&self, bearer_id: u8) -> Option<BearerMap> {
        self.tables.lock().bearers.by_id(bearer_id).map(Bearer::snapshot)
    }

    /// Copies of every flow, in no particular order.
    pub fn flows(&self) -> Vec<FlowMap> {
        self.tables.lock().flows.iter().map(|(key, flow)| flow.snapshot(*key)).collect()
    }

    /// Copies of every live bearer, in no particular order.
    pub fn bearers(&self) -> Vec<BearerMap> {
        self.tables.lock().bearers.iter().map(Bearer::snapshot).collect()
    }

    /// The id of the bearer gating transmit queue `index`.
    pub fn queue_owner(&self, index: u16) -> Option<u8> {
        let tables = self.tables.lock();
        let key = (*tables.queue_map.get(usize::from(index))?)?;
        tables.bearers.get(key).map(|bearer| bearer.bearer_id)
    }

    /// The owning flow and precedence of every installed rule, in match order.
    pub fn filters(&self) -> Vec<(FlowKey, u32)> {
        self.tables.lock().filters.iter().map(|rule| (rule.owner, rule.precedence)).collect()
    }

    /// Stops every watchdog, frees every bearer and clears all tables.
    pub fn shutdown(&self) {
        let _control = self.control.lock();

        let bearers = {
            let mut tables = self.tables.lock();
            tables.flows.clear();
            tables.filters.clear();
            tables.queue_map = Default::default();
            tables.pending_removal = None;
            self.num_filters.store(0, Ordering::Release);

            let mut bearers = tables.bearers.drain();
            for bearer in bearers.iter_mut() {
                Self::watchdog_stop(bearer);
            }
            bearers
        };

        // Expiries that already started find no bearer once they get the lock.
        for bearer in &bearers {
            if let Some(timer) = &bearer.watchdog.timer {
                timer.cancel_sync();
            }
        }

        debug!(mux_id = self.mux_id, bearers = bearers.len(), "context shut down");
    }
}

impl std::fmt::Debug for QosContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosContext")
            .field("mux_id", &self.mux_id)
            .field("tables", &self.tables)
            .field("options", &self.options)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
