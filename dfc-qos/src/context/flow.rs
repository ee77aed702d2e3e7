use dfc_common::AddressFamily;

use super::bearer::BearerKey;
use crate::filter::FilterId;

/// Identifies a flow. The same id may exist once per address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub flow_id: u32,
    pub family: AddressFamily,
}

impl FlowKey {
    pub const fn new(flow_id: u32, family: AddressFamily) -> Self {
        Self { flow_id, family }
    }
}

#[derive(Debug)]
pub(crate) struct Flow {
    pub(crate) bearer_id: u8,
    pub(crate) queue_index: u16,
    pub(crate) bearer: BearerKey,
    pub(crate) filters: Vec<FilterId>,
}

impl Flow {
    pub(crate) fn snapshot(&self, key: FlowKey) -> FlowMap {
        FlowMap {
            flow_id: key.flow_id,
            family: key.family,
            bearer_id: self.bearer_id,
            queue_index: self.queue_index,
            filters: self.filters.len(),
        }
    }
}

/// A point-in-time copy of a flow binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMap {
    pub flow_id: u32,
    pub family: AddressFamily,
    pub bearer_id: u8,
    pub queue_index: u16,
    /// Number of filter rules installed for the flow.
    pub filters: usize,
}
