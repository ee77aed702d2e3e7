use std::net::{Ipv4Addr, Ipv6Addr};

use dfc_common::AddressFamily;
use dfc_qos::{DfcMode, FilterSpec};
use dfc_wire::{
    proto,
    synth::{tcp_v4, udp_v4, udp_v6, PacketBuilder, TcpFlags},
    Packet,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::context;

const V4: AddressFamily = AddressFamily::Inet;

#[tokio::test(start_paused = true)]
async fn shuffled_install_stays_sorted() {
    let (ctx, _queues) = context(DfcMode::FlowId);
    for flow_id in 1..=4 {
        ctx.add_flow(1, flow_id, V4, 1).unwrap();
    }

    let mut rng = StdRng::seed_from_u64(42);
    let mut precedences: Vec<u32> = (0..64).map(|p| p * 3).collect();
    precedences.shuffle(&mut rng);

    for precedence in precedences {
        let flow_id = rng.gen_range(1..=4);
        ctx.add_filter(flow_id, V4, &FilterSpec::new(precedence)).unwrap();
    }

    let installed: Vec<u32> = ctx.filters().into_iter().map(|(_, p)| p).collect();
    assert_eq!(installed.len(), 64);
    assert!(installed.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(ctx.num_filters(), 64);
}

#[tokio::test(start_paused = true)]
async fn equal_precedence_keeps_install_order() {
    let (ctx, _queues) = context(DfcMode::FlowId);
    ctx.add_flow(1, 1, V4, 1).unwrap();
    ctx.add_flow(1, 2, V4, 2).unwrap();

    ctx.add_filter(2, V4, &FilterSpec::new(5).protocol(proto::UDP)).unwrap();
    ctx.add_filter(1, V4, &FilterSpec::new(5).protocol(proto::UDP)).unwrap();

    let mut packet = udp_v4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, 0);
    ctx.mark_packet(&mut packet);
    assert_eq!(packet.mark(), 2);
}

fn sample_packets() -> Vec<Packet> {
    let mut packets = Vec::new();
    for (a, b) in [(10, 1), (10, 2), (192, 168), (172, 16)] {
        let src = Ipv4Addr::new(a, b, 3, 4);
        let dst = Ipv4Addr::new(8, 8, a, b);
        packets.push(udp_v4(src, dst, 1000 + u16::from(b), 53, 20));
        packets.push(tcp_v4(src, dst, 40000, 443, TcpFlags::ACK, 0));
        packets.push(PacketBuilder::new(src.into(), dst.into()).fragmented().udp(1, 2, 100));
    }
    packets
}

#[tokio::test(start_paused = true)]
async fn adding_mask_bits_only_narrows() {
    let specs = [
        FilterSpec::new(0).protocol(proto::UDP),
        FilterSpec::new(0).protocol(proto::UDP).source(Ipv4Addr::new(10, 0, 0, 0).into(), 8),
        FilterSpec::new(0)
            .protocol(proto::UDP)
            .source(Ipv4Addr::new(10, 0, 0, 0).into(), 8)
            .destination_ports(53, 0),
        FilterSpec::new(0)
            .protocol(proto::UDP)
            .source(Ipv4Addr::new(10, 1, 0, 0).into(), 16)
            .destination_ports(53, 0),
    ];

    let mut previous: Option<Vec<bool>> = None;
    for spec in specs {
        let (ctx, _queues) = context(DfcMode::FlowId);
        ctx.add_flow(1, 7, V4, 1).unwrap();
        ctx.add_filter(7, V4, &spec).unwrap();

        let matches: Vec<bool> = sample_packets()
            .into_iter()
            .map(|mut packet| {
                ctx.mark_packet(&mut packet);
                packet.mark() == 7
            })
            .collect();

        if let Some(previous) = &previous {
            for (narrow, wide) in matches.iter().zip(previous) {
                assert!(!narrow || *wide, "a narrower rule matched a packet the wider one did not");
            }
        }
        previous = Some(matches);
    }

    // Protocol alone matches every UDP packet, fragments included.
    let wide = {
        let (ctx, _queues) = context(DfcMode::FlowId);
        ctx.add_flow(1, 7, V4, 1).unwrap();
        ctx.add_filter(7, V4, &FilterSpec::new(0).protocol(proto::UDP)).unwrap();
        sample_packets()
            .into_iter()
            .filter(|packet| packet.data()[9] == proto::UDP)
            .all(|mut packet| {
                ctx.mark_packet(&mut packet);
                packet.mark() == 7
            })
    };
    assert!(wide);
}

#[tokio::test(start_paused = true)]
async fn ipv6_rules_use_all_address_words() {
    let (ctx, _queues) = context(DfcMode::FlowId);
    ctx.add_flow(1, 3, AddressFamily::Inet6, 1).unwrap();

    let net: Ipv6Addr = "2001:db8:aa::".parse().unwrap();
    ctx.add_filter(3, AddressFamily::Inet6, &FilterSpec::new(0).destination(net.into(), 48))
        .unwrap();

    let inside: Ipv6Addr = "2001:db8:aa:1::9".parse().unwrap();
    let outside: Ipv6Addr = "2001:db8:ab::9".parse().unwrap();

    let mut hit = udp_v6(Ipv6Addr::LOCALHOST, inside, 1, 2, 0);
    let mut miss = udp_v6(Ipv6Addr::LOCALHOST, outside, 1, 2, 0);
    ctx.mark_packet(&mut hit);
    ctx.mark_packet(&mut miss);
    assert_eq!(hit.mark(), 3);
    assert_eq!(miss.mark(), 0);

    // IPv6 rules never match IPv4 packets.
    let mut v4 = udp_v4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, 0);
    ctx.mark_packet(&mut v4);
    assert_eq!(v4.mark(), 0);
}
