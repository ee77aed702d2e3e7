//! Per-packet classification and transmit queue selection.

use std::sync::atomic::Ordering;

use dfc_common::constants::{DEFAULT_ACK_MQ_NUM, DEFAULT_MQ_NUM};
use dfc_wire::{dissect, Packet};
use tracing::trace;

use super::{FlowKey, QosContext};
use crate::config::DfcMode;

impl QosContext {
    /// Stamps the packet with the flow id of the first matching filter rule, or zero.
    pub fn mark_packet(&self, packet: &mut Packet) {
        packet.set_mark(0);

        if self.num_filters.load(Ordering::Acquire) == 0 {
            return;
        }

        let di = match dissect(packet) {
            Ok(di) => di,
            Err(e) => {
                trace!(mux_id = self.mux_id, ?e, "cannot classify packet");
                self.stats.increment_dissect_failures();
                return;
            }
        };

        let mark = {
            let tables = self.tables.lock();
            tables.filters.iter().find(|rule| rule.matches(&di)).map(|rule| rule.owner.flow_id)
        };

        match mark {
            Some(flow_id) => {
                packet.set_mark(flow_id);
                self.stats.increment_marked();
            }
            None => self.stats.increment_unmarked(),
        }
    }

    /// Picks the transmit queue for an already marked packet.
    pub fn select_queue(&self, packet: &Packet) -> u16 {
        match self.tunables.mode() {
            // Marks beyond the queue index space fall back to the default queue.
            Some(DfcMode::QueueNumber) => u16::try_from(packet.mark()).unwrap_or(DEFAULT_MQ_NUM),
            Some(DfcMode::StandaloneGrant) => self.select_standalone(packet),
            Some(DfcMode::FlowId) | None => self.select_by_flow(packet),
        }
    }

    fn select_standalone(&self, packet: &Packet) -> u16 {
        if packet.is_ipv6_ndp() {
            return DEFAULT_MQ_NUM;
        }

        let pure_ack = packet.is_tcp_pure_ack();
        let key = FlowKey::new(packet.mark(), packet.family());

        let tables = self.tables.lock();
        let Some(flow) = tables.flows.get(&key) else {
            return DEFAULT_MQ_NUM;
        };

        if pure_ack {
            if let Some(ack) = tables.bearers.get(flow.bearer).and_then(|b| b.ack_queue_index) {
                return ack;
            }
        }

        flow.queue_index
    }

    fn select_by_flow(&self, packet: &Packet) -> u16 {
        let mark = packet.mark();
        if mark == 0 {
            return if packet.is_tcp_pure_ack() { DEFAULT_ACK_MQ_NUM } else { DEFAULT_MQ_NUM };
        }

        let key = FlowKey::new(mark, packet.family());
        self.tables.lock().flows.get(&key).map_or(DEFAULT_MQ_NUM, |flow| flow.queue_index)
    }
}
