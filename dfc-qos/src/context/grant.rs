//! Grant accounting: modem grant indications, transmit debits and bulk re-enable.

use dfc_common::{constants::DEFAULT_GRANT, AddressFamily};
use tracing::{debug, trace};

use super::{FlowKey, QosContext};

/// A grant indication for one bearer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantUpdate {
    pub bearer_id: u8,
    /// Bytes the bearer may transmit. Zero closes the bearer's queues.
    pub grant_bytes: u32,
    pub sequence: u32,
    pub ack_required: bool,
    pub tcp_bidirectional: bool,
    /// Marks the indications that open (zero grant) and close (non-zero grant) a radio access
    /// technology switch. Other indications received in between are dropped.
    pub rat_switch: bool,
}

impl GrantUpdate {
    pub fn new(bearer_id: u8, grant_bytes: u32, sequence: u32) -> Self {
        Self {
            bearer_id,
            grant_bytes,
            sequence,
            ack_required: false,
            tcp_bidirectional: false,
            rat_switch: false,
        }
    }

    pub fn ack_required(mut self, ack_required: bool) -> Self {
        self.ack_required = ack_required;
        self
    }

    pub fn tcp_bidirectional(mut self, bidirectional: bool) -> Self {
        self.tcp_bidirectional = bidirectional;
        self
    }

    pub fn rat_switch(mut self, rat_switch: bool) -> Self {
        self.rat_switch = rat_switch;
        self
    }
}

impl QosContext {
    /// Applies a grant indication. Returns `false` if the indication was dropped.
    pub fn update_grant(&self, update: GrantUpdate) -> bool {
        let mut tables = self.tables.lock();
        let Some(key) = tables.bearers.lookup(update.bearer_id) else {
            debug!(mux_id = self.mux_id, bearer_id = update.bearer_id, "grant for unknown bearer");
            return false;
        };
        let Some(bearer) = tables.bearers.get_mut(key) else {
            return false;
        };

        if update.rat_switch {
            bearer.rat_switch_pending = update.grant_bytes == 0;
        } else if bearer.rat_switch_pending {
            trace!(bearer_id = update.bearer_id, "dropping grant during rat switch");
            return false;
        }

        if bearer.tx_off && update.grant_bytes > 0 {
            trace!(bearer_id = update.bearer_id, "dropping grant while tx is off");
            return false;
        }

        let toggles = (bearer.grant_bytes == 0) != (update.grant_bytes == 0);

        bearer.grant_bytes = update.grant_bytes;
        bearer.grant_threshold = self.tunables.grant_threshold(update.grant_bytes);
        bearer.sequence = update.sequence;
        bearer.ack_required = update.ack_required;
        bearer.tcp_bidirectional = update.tcp_bidirectional;

        debug!(
            mux_id = self.mux_id,
            bearer_id = update.bearer_id,
            grant = update.grant_bytes,
            seq = update.sequence,
            "grant update"
        );

        if toggles {
            self.bearer_flow_ctl(bearer);
        }

        if update.grant_bytes > 0 {
            Self::watchdog_stop(bearer);
        }

        true
    }

    /// Debits `len` transmitted bytes from the bearer of flow `(mark, family)`.
    ///
    /// A bearer that runs out of grant closes its queues and arms its watchdog.
    pub fn burst_check(&self, family: AddressFamily, mark: u32, len: u32) {
        let mut tables = self.tables.lock();
        let Some(key) = tables.flows.get(&FlowKey::new(mark, family)).map(|flow| flow.bearer) else {
            return;
        };
        let Some(bearer) = tables.bearers.get_mut(key) else {
            return;
        };

        bearer.bytes_in_flight += u64::from(len);
        if bearer.grant_bytes == 0 {
            return;
        }

        if bearer.grant_bytes > len {
            bearer.grant_bytes -= len;
            return;
        }

        bearer.grant_bytes = 0;
        bearer.sequence = bearer.sequence.wrapping_add(1);
        debug!(mux_id = self.mux_id, bearer_id = bearer.bearer_id, "grant depleted");
        self.bearer_flow_ctl(bearer);
        self.watchdog_arm(&mut tables, key);
    }

    /// Records the transmit link status of a bearer. While transmit is off the bearer's queues
    /// stay closed and positive grants are dropped.
    pub fn set_tx_status(&self, bearer_id: u8, enabled: bool) {
        let mut tables = self.tables.lock();
        let Some(key) = tables.bearers.lookup(bearer_id) else {
            return;
        };
        let Some(bearer) = tables.bearers.get_mut(key) else {
            return;
        };

        if bearer.tx_off != enabled {
            return;
        }
        bearer.tx_off = !enabled;
        debug!(mux_id = self.mux_id, bearer_id, enabled, "tx status");

        if bearer.tx_off {
            bearer.grant_bytes = 0;
            bearer.grant_threshold = 0;
            self.bearer_flow_ctl(bearer);
            Self::watchdog_stop(bearer);
        } else {
            // Without a fresh grant the watchdog reopens the bearer.
            self.watchdog_arm(&mut tables, key);
        }
    }

    /// Resets every bearer's grant state and reopens the queues of bearers left without
    /// grant. Bearers whose transmit is off only have their state reset.
    pub fn enable_all_flows(&self) {
        let mut tables = self.tables.lock();

        for key in tables.bearers.keys() {
            let Some(bearer) = tables.bearers.get_mut(key) else {
                continue;
            };

            bearer.sequence = 0;
            bearer.ack_required = false;
            bearer.bytes_in_flight = 0;
            bearer.tcp_bidirectional = false;
            bearer.rat_switch_pending = false;
            Self::watchdog_stop(bearer);

            if bearer.tx_off {
                continue;
            }

            let wake = bearer.grant_bytes == 0;
            bearer.grant_bytes = DEFAULT_GRANT;
            bearer.grant_threshold = self.tunables.grant_threshold(DEFAULT_GRANT);
            if wake {
                self.bearer_flow_ctl(bearer);
            }
        }

        trace!(mux_id = self.mux_id, "enabled all flows");
    }

    /// Returns `true` if every bearer holds a non-zero grant.
    pub fn all_flows_enabled(&self) -> bool {
        self.tables.lock().bearers.iter().all(|bearer| bearer.grant_bytes > 0)
    }
}
