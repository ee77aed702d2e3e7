//! Transmit flow control for multiplexed cellular data interfaces.
//!
//! Each virtual interface of a port gets a [`QosContext`] that binds flows to radio bearers and
//! bearers to transmit queues, stamps outgoing packets with the flow id of the first matching
//! filter rule and picks their queue. Bearers carry a byte grant issued by the modem: a bearer
//! that runs dry closes its queues until a fresh grant, or its stall watchdog, reopens them.
//!
//! The [`Engine`] owns the contexts of a port, the modem clients and the [`PowerSave`] poll
//! task, and applies the [`Command`]s of the link configuration channel.

use thiserror::Error;

mod client;
pub use client::{slot_for, ClientRegistry};

mod config;
pub use config::{DfcMode, ModeFlags, PowerSaveOptions, QosOptions, Tunables};

mod context;
pub use context::{BearerMap, FlowKey, FlowMap, GrantUpdate, QosContext};

mod engine;
pub use engine::{Command, Engine};

mod filter;
pub use filter::{FieldMask, FilterId, FilterSpec};

pub mod powersave;
pub use powersave::{FlowGate, ListenerId, Listeners, PowerSave, PowerSaveListener};

mod stats;
pub use stats::QosStats;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QosError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    #[error("No context for mux id {0}")]
    NoContext(u8),
}
