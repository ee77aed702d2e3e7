use std::{net::Ipv4Addr, sync::Arc, time::Duration};

use dfc::{
    memory::{MemoryModem, MemoryQueues},
    proto,
    synth::udp_v4,
    AddressFamily, Command, DfcMode, Engine, FilterSpec, GrantUpdate, ModeFlags, PowerSaveListener,
    TokioScheduler,
};

struct Logger;

impl PowerSaveListener for Logger {
    fn on_enter(&self) {
        tracing::info!("port entered power-save");
    }

    fn on_exit(&self) {
        tracing::info!("port left power-save");
    }
}

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt::try_init();

    let modem = Arc::new(MemoryModem::new());
    let queues = Arc::new(MemoryQueues::new(16));
    let engine = Engine::new(modem.clone(), Arc::new(TokioScheduler::try_current().unwrap()));
    engine.register_powersave_listener(Arc::new(Logger));

    // Flow-id queue selection with power-save.
    let flags = ModeFlags(DfcMode::FlowId as u32 | ModeFlags::POWERSAVE);
    let ctx = engine.add_context(1, queues.clone());
    engine.change_link(1, Command::ConfigureClient { instance: 0, flags }).unwrap();

    let family = AddressFamily::Inet;
    engine
        .change_link(1, Command::ActivateFlow { bearer_id: 5, flow_id: 10, family, queue_index: 2 })
        .unwrap();
    let spec = FilterSpec::new(0).protocol(proto::UDP).destination_ports(53, 0);
    engine.change_link(1, Command::AddFilter { flow_id: 10, family, spec }).unwrap();

    engine.update_grant(1, GrantUpdate::new(5, 300, 1)).unwrap();

    let mut dns = udp_v4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(1, 1, 1, 1), 40000, 53, 512);
    let queue = engine.classify(1, &mut dns).unwrap();
    println!("DNS query: mark {} on queue {queue}", dns.mark());

    engine.on_transmit(1, &dns);
    let bearer = ctx.get_bearer_map(5).unwrap();
    println!(
        "Bearer 5: grant {} seq {}, queue 2 enabled: {}",
        bearer.grant_bytes,
        bearer.sequence,
        queues.is_enabled(2)
    );

    // The watchdog hands the stalled bearer the default grant.
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Bearer 5 after watchdog: grant {}", ctx.get_bearer_map(5).unwrap().grant_bytes);

    // An idle port drops into power-save after one poll interval.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    println!("Grant suppression requests: {:?}", modem.suppression_calls());

    engine.shutdown();
}
