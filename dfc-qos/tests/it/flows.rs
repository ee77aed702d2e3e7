use std::collections::HashMap;

use dfc_common::{
    constants::{DEFAULT_GRANT, MAX_MQ_NUM, WATCHDOG_INTERVAL},
    AddressFamily,
};
use dfc_qos::{DfcMode, GrantUpdate, QosContext};
use dfc_transport::memory::QueueEvent;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::context;

const BEARER: u8 = 5;

fn entries_owned_by(ctx: &QosContext, bearer_id: u8) -> usize {
    (0..MAX_MQ_NUM as u16).filter(|q| ctx.queue_owner(*q) == Some(bearer_id)).count()
}

#[tokio::test(start_paused = true)]
async fn reference_count_tracks_random_mutations() {
    let _ = tracing_subscriber::fmt::try_init();
    let (ctx, _queues) = context(DfcMode::FlowId);

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut bound: HashMap<(u32, AddressFamily), u16> = HashMap::new();

    for _ in 0..500 {
        let flow_id = rng.gen_range(1..8);
        let family = if rng.gen_bool(0.5) { AddressFamily::Inet } else { AddressFamily::Inet6 };

        if rng.gen_bool(0.6) {
            let queue = rng.gen_range(1..4);
            ctx.add_flow(BEARER, flow_id, family, queue).unwrap();
            bound.insert((flow_id, family), queue);
        } else {
            ctx.del_flow(BEARER, flow_id, family);
            bound.remove(&(flow_id, family));
        }

        match ctx.get_bearer_map(BEARER) {
            Some(bearer) => assert_eq!(bearer.flow_refs as usize, bound.len()),
            None => assert!(bound.is_empty()),
        }
        assert_eq!(ctx.flows().len(), bound.len());
    }

    for ((flow_id, family), queue) in bound {
        assert_eq!(ctx.get_flow_map(flow_id, family).unwrap().queue_index, queue);
    }
}

#[tokio::test(start_paused = true)]
async fn rebind_moves_queue_ownership() {
    let (ctx, _queues) = context(DfcMode::FlowId);

    ctx.add_flow(1, 10, AddressFamily::Inet, 2).unwrap();
    ctx.add_flow(1, 10, AddressFamily::Inet6, 3).unwrap();
    let before = entries_owned_by(&ctx, 1);
    assert_eq!(before, 2);

    // Bearer 1 keeps its other flow: its queue map entries stay as they are.
    ctx.add_flow(2, 10, AddressFamily::Inet, 4).unwrap();
    assert!(entries_owned_by(&ctx, 1) <= before);
    assert_eq!(ctx.get_bearer_map(1).unwrap().flow_refs, 1);
    assert_eq!(ctx.queue_owner(4), Some(2));

    // Last flow of bearer 1 moves away: every entry of the old bearer is cleared.
    ctx.add_flow(2, 10, AddressFamily::Inet6, 5).unwrap();
    assert!(ctx.get_bearer_map(1).is_none());
    assert_eq!(entries_owned_by(&ctx, 1), 0);
    assert_eq!(ctx.get_bearer_map(2).unwrap().flow_refs, 2);
}

#[tokio::test(start_paused = true)]
async fn deleting_last_flow_enables_all_queues_once() {
    let (ctx, queues) = context(DfcMode::FlowId);

    for flow_id in 1..=3 {
        ctx.add_flow(BEARER, flow_id, AddressFamily::Inet, 2).unwrap();
    }

    ctx.del_flow(BEARER, 1, AddressFamily::Inet);
    ctx.del_flow(BEARER, 2, AddressFamily::Inet);
    assert_eq!(queues.count(QueueEvent::EnableAll), 0);

    ctx.del_flow(BEARER, 3, AddressFamily::Inet);
    assert_eq!(queues.count(QueueEvent::EnableAll), 1);
    assert_eq!(queues.count(QueueEvent::Reset(2)), 1);
}

#[tokio::test(start_paused = true)]
async fn watchdog_restores_zero_grant() {
    let (ctx, queues) = context(DfcMode::StandaloneGrant);

    ctx.add_flow(BEARER, 1, AddressFamily::Inet, 3).unwrap();
    assert!(ctx.update_grant(GrantUpdate::new(BEARER, 0, 1)));
    assert!(!queues.is_enabled(3));
    assert!(!queues.is_enabled(3 + 15));
    queues.take_events();

    tokio::time::sleep(WATCHDOG_INTERVAL * 2).await;

    let bearer = ctx.get_bearer_map(BEARER).unwrap();
    assert_eq!(bearer.grant_bytes, DEFAULT_GRANT);
    assert_eq!(bearer.watchdog_expiries, 1);
    assert_eq!(queues.take_events(), vec![QueueEvent::Enable(3), QueueEvent::Enable(18)]);
}

#[tokio::test(start_paused = true)]
async fn concurrent_datapath_and_control() {
    let (ctx, _queues) = context(DfcMode::FlowId);
    ctx.add_flow(BEARER, 1, AddressFamily::Inet, 2).unwrap();

    let reader = {
        let ctx = ctx.clone();
        std::thread::spawn(move || {
            let packet = dfc_wire::synth::udp_v4(
                [10, 0, 0, 1].into(),
                [10, 0, 0, 2].into(),
                1,
                2,
                100,
            );
            let mut marked = packet.clone();
            marked.set_mark(1);
            for _ in 0..10_000 {
                let queue = ctx.select_queue(&marked);
                assert!(queue == 2 || queue == 0);
                ctx.burst_check(AddressFamily::Inet, 1, 1);
            }
        })
    };

    for i in 0..200 {
        ctx.add_flow(BEARER + (i % 2) as u8, 1, AddressFamily::Inet, 2).unwrap();
        ctx.update_grant(GrantUpdate::new(BEARER, 5000, i));
    }

    reader.join().unwrap();
    ctx.del_flow(BEARER, 1, AddressFamily::Inet);
    assert!(ctx.bearers().is_empty());
}
