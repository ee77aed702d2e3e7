#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use dfc_common::{constants, AddressFamily, Scheduler, TimerHandle, TokioScheduler, WakeClock};
pub use dfc_qos::*;
pub use dfc_transport::*;
pub use dfc_wire::{dissect, proto, synth, Dissected, Packet};
