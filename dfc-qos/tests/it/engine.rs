use std::{net::Ipv4Addr, sync::Arc};

use dfc_common::{constants::DEFAULT_SCALE_FACTOR, AddressFamily, TokioScheduler};
use dfc_qos::{Command, DfcMode, Engine, FilterSpec, GrantUpdate, ModeFlags, QosError};
use dfc_transport::memory::{MemoryModem, MemoryQueues};
use dfc_wire::{proto, synth::udp_v4};

fn engine() -> Engine {
    Engine::new(Arc::new(MemoryModem::new()), Arc::new(TokioScheduler::try_current().unwrap()))
}

fn activate(bearer_id: u8, flow_id: u32, queue_index: u16) -> Command {
    Command::ActivateFlow { bearer_id, flow_id, family: AddressFamily::Inet, queue_index }
}

#[tokio::test(start_paused = true)]
async fn activation_requires_grant_client() {
    let _ = tracing_subscriber::fmt::try_init();
    let engine = engine();
    let ctx = engine.add_context(1, Arc::new(MemoryQueues::new(16)));

    engine.change_link(1, activate(5, 10, 2)).unwrap();
    assert!(ctx.flows().is_empty());

    let flags = ModeFlags(DfcMode::FlowId as u32);
    engine.change_link(1, Command::ConfigureClient { instance: 0, flags }).unwrap();
    assert!(engine.clients().has_grant_client(0));

    engine.change_link(1, activate(5, 10, 2)).unwrap();
    let flow = ctx.get_flow_map(10, AddressFamily::Inet).unwrap();
    assert_eq!(flow.bearer_id, 5);
    assert_eq!(flow.queue_index, 2);

    let family = AddressFamily::Inet;
    let deactivate = Command::DeactivateFlow { bearer_id: 5, flow_id: 10, family };
    engine.change_link(1, deactivate).unwrap();
    assert!(ctx.flows().is_empty());
    assert!(ctx.bearers().is_empty());

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unknown_interface() {
    let engine = engine();
    engine.configure_client(0, ModeFlags(DfcMode::FlowId as u32));

    let err = engine.change_link(3, activate(5, 10, 2)).unwrap_err();
    assert_eq!(err, QosError::NoContext(3));

    let err = engine.update_grant(3, GrantUpdate::new(5, 100, 1)).unwrap_err();
    assert_eq!(err, QosError::NoContext(3));

    let mut packet = udp_v4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, 0);
    assert_eq!(engine.classify(3, &mut packet), None);

    // Port-wide commands do not need an interface.
    engine.change_link(3, Command::SetScaleFactor(2)).unwrap();
    assert_eq!(engine.tunables().scale_factor(), 2);
}

#[tokio::test(start_paused = true)]
async fn zero_scale_factor_is_ignored() {
    let engine = engine();
    engine.change_link(1, Command::SetScaleFactor(0)).unwrap();
    assert_eq!(engine.tunables().scale_factor(), DEFAULT_SCALE_FACTOR);
}

#[tokio::test(start_paused = true)]
async fn filter_commands_drive_classification() {
    let engine = engine();
    let ctx = engine.add_context(1, Arc::new(MemoryQueues::new(16)));
    engine.configure_client(0, ModeFlags(DfcMode::FlowId as u32));
    engine.change_link(1, activate(5, 10, 2)).unwrap();

    let spec = FilterSpec::new(1).protocol(proto::UDP).destination_ports(53, 0);
    engine
        .change_link(1, Command::AddFilter { flow_id: 10, family: AddressFamily::Inet, spec })
        .unwrap();
    assert_eq!(ctx.num_filters(), 1);

    let mut dns = udp_v4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(8, 8, 8, 8), 40000, 53, 32);
    assert_eq!(engine.classify(1, &mut dns), Some(2));
    assert_eq!(dns.mark(), 10);

    let mut other = udp_v4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(8, 8, 8, 8), 40000, 443, 32);
    assert_eq!(engine.classify(1, &mut other), Some(0));
    assert_eq!(other.mark(), 0);

    engine
        .change_link(1, Command::RemoveFilter { flow_id: 10, family: AddressFamily::Inet })
        .unwrap();
    assert_eq!(ctx.num_filters(), 0);

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn transmit_consumes_grant() {
    let engine = engine();
    let queues = Arc::new(MemoryQueues::new(16));
    let ctx = engine.add_context(1, queues.clone());
    engine.configure_client(0, ModeFlags(DfcMode::FlowId as u32));
    engine.change_link(1, activate(5, 10, 2)).unwrap();
    assert!(engine.update_grant(1, GrantUpdate::new(5, 100, 1)).unwrap());

    let mut packet = udp_v4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, 200);
    packet.set_mark(10);
    engine.on_transmit(1, &packet);

    let bearer = ctx.get_bearer_map(5).unwrap();
    assert_eq!(bearer.grant_bytes, 0);
    assert_eq!(bearer.sequence, 2);
    assert!(!queues.is_enabled(2));
    assert!(!ctx.all_flows_enabled());

    engine.shutdown();
}

#[tokio::test(start_paused = true)]
async fn remove_context_tears_down() {
    let engine = engine();
    let ctx = engine.add_context(1, Arc::new(MemoryQueues::new(16)));
    assert!(Arc::ptr_eq(&ctx, &engine.add_context(1, Arc::new(MemoryQueues::new(16)))));

    engine.configure_client(0, ModeFlags(DfcMode::FlowId as u32));
    engine.change_link(1, activate(5, 10, 2)).unwrap();

    assert!(engine.remove_context(1));
    assert!(!engine.remove_context(1));
    assert!(engine.context(1).is_none());
    assert!(ctx.flows().is_empty());
    assert!(ctx.bearers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn second_instance_uses_slot_one() {
    let engine = engine();
    engine.configure_client(7, ModeFlags(DfcMode::StandaloneGrant as u32));
    assert!(engine.clients().has_grant_client(1));
    assert!(engine.powersave().is_none());
    assert_eq!(engine.tunables().mode(), Some(DfcMode::StandaloneGrant));

    engine.change_link(0, Command::DeleteClient { instance: 7 }).unwrap();
    assert!(!engine.clients().any_grant_client());
}
