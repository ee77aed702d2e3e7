use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dfc_common::{AddressFamily, TokioScheduler};
use dfc_qos::{Engine, GrantUpdate, ModeFlags, PowerSaveListener};
use dfc_transport::memory::{MemoryModem, MemoryQueues};
use dfc_wire::synth::udp_v4;
use tokio::time::sleep;

/// Flow-id mode with the power-save bit.
const FLAGS: ModeFlags = ModeFlags(0x12);
const POLL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Transitions {
    entered: AtomicUsize,
    resumed: AtomicUsize,
}

impl PowerSaveListener for Transitions {
    fn on_enter(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
    }

    fn on_exit(&self) {
        self.resumed.fetch_add(1, Ordering::SeqCst);
    }
}

fn engine() -> (Engine, Arc<MemoryModem>, Arc<Transitions>) {
    let modem = Arc::new(MemoryModem::new());
    let engine = Engine::new(modem.clone(), Arc::new(TokioScheduler::try_current().unwrap()));
    let transitions = Arc::new(Transitions::default());
    engine.register_powersave_listener(transitions.clone());
    (engine, modem, transitions)
}

#[tokio::test(start_paused = true)]
async fn idle_ticks_enter_and_traffic_resumes() {
    let _ = tracing_subscriber::fmt::try_init();
    let (engine, modem, transitions) = engine();
    engine.add_context(1, Arc::new(MemoryQueues::new(16)));
    engine.configure_client(0, FLAGS);

    // Two idle poll intervals: one transition, one notification.
    sleep(POLL * 2 + POLL / 10).await;
    assert_eq!(transitions.entered.load(Ordering::SeqCst), 1);
    assert!(engine.powersave().unwrap().is_enabled());
    assert_eq!(modem.suppression_calls(), vec![true]);
    assert!(modem.queries().is_empty());

    let packet = udp_v4([10, 0, 0, 1].into(), [10, 0, 0, 2].into(), 1, 2, 10);
    engine.on_transmit(1, &packet);
    sleep(Duration::from_millis(1)).await;

    assert_eq!(transitions.resumed.load(Ordering::SeqCst), 1);
    assert!(!engine.powersave().unwrap().is_enabled());
    assert_eq!(modem.suppression_calls(), vec![true, false]);
    assert_eq!(modem.queries(), vec![0]);

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn grants_are_ignored_in_powersave() {
    let (engine, modem, _transitions) = engine();
    let ctx = engine.add_context(1, Arc::new(MemoryQueues::new(16)));
    engine.configure_client(0, FLAGS);
    ctx.add_flow(4, 1, AddressFamily::Inet, 2).unwrap();

    sleep(POLL + POLL / 10).await;
    assert!(engine.powersave().unwrap().is_enabled());

    assert!(!engine.update_grant(1, GrantUpdate::new(4, 100, 2)).unwrap());
    assert_eq!(ctx.get_bearer_map(4).unwrap().grant_bytes, 20480);

    // Leaving power-save lets grants through again.
    engine.on_transmit(1, &udp_v4([10, 0, 0, 1].into(), [10, 0, 0, 2].into(), 1, 2, 10));
    sleep(Duration::from_millis(1)).await;
    assert!(engine.update_grant(1, GrantUpdate::new(4, 100, 3)).unwrap());
    assert_eq!(ctx.get_bearer_map(4).unwrap().grant_bytes, 100);
    assert_eq!(modem.suppression_calls(), vec![true, false]);

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn deleting_instance_zero_stops_polling() {
    let (engine, modem, transitions) = engine();
    engine.configure_client(0, FLAGS);
    assert!(engine.clients().has_powersave_client());

    engine.delete_client(0);
    assert!(engine.powersave().is_none());
    assert!(!engine.clients().has_powersave_client());

    sleep(POLL * 3).await;
    assert!(modem.suppression_calls().is_empty());
    assert_eq!(transitions.entered.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn deregistered_listener_is_not_notified() {
    let modem = Arc::new(MemoryModem::new());
    let engine = Engine::new(modem, Arc::new(TokioScheduler::try_current().unwrap()));
    let transitions = Arc::new(Transitions::default());
    let id = engine.register_powersave_listener(transitions.clone());
    assert!(engine.deregister_powersave_listener(id));
    assert!(!engine.deregister_powersave_listener(id));

    engine.configure_client(0, FLAGS);
    sleep(POLL * 2).await;
    assert!(engine.powersave().unwrap().is_enabled());
    assert_eq!(transitions.entered.load(Ordering::SeqCst), 0);
    engine.shutdown();
}
