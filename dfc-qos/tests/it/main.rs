use std::sync::Arc;

use dfc_common::{constants::MAX_MQ_NUM, TokioScheduler};
use dfc_qos::{DfcMode, QosContext, QosOptions, Tunables};
use dfc_transport::memory::MemoryQueues;

mod engine;
mod filters;
mod flows;
mod powersave;
mod selection;

/// A context on a device with room for data and ack queues. Must run inside a Tokio runtime.
fn context(mode: DfcMode) -> (Arc<QosContext>, Arc<MemoryQueues>) {
    let queues = Arc::new(MemoryQueues::new(MAX_MQ_NUM * 2));
    let scheduler = TokioScheduler::try_current().expect("tests run on a tokio runtime");
    let ctx = QosContext::new(
        1,
        queues.clone(),
        Arc::new(scheduler),
        Arc::new(Tunables::with_mode(mode)),
        QosOptions::default(),
    );
    (ctx, queues)
}
