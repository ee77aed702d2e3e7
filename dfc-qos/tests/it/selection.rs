use std::net::{Ipv4Addr, Ipv6Addr};

use dfc_common::{
    constants::{ACK_MQ_OFFSET, DEFAULT_ACK_MQ_NUM, DEFAULT_MQ_NUM},
    AddressFamily,
};
use dfc_qos::{DfcMode, FilterSpec};
use dfc_wire::{
    proto,
    synth::{tcp_v4, tcp_v6, TcpFlags},
};

use crate::context;

#[tokio::test(start_paused = true)]
async fn queue_number_mode_ignores_tables() {
    let (ctx, _queues) = context(DfcMode::QueueNumber);
    ctx.add_flow(1, 7, AddressFamily::Inet, 2).unwrap();

    let mut packet = tcp_v4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, TcpFlags::ACK, 0);
    packet.set_mark(7);
    assert_eq!(ctx.select_queue(&packet), 7);
}

#[tokio::test(start_paused = true)]
async fn standalone_pure_ack_uses_ack_queue() {
    let (ctx, _queues) = context(DfcMode::StandaloneGrant);
    ctx.add_flow(9, 4, AddressFamily::Inet6, 3).unwrap();
    ctx.add_filter(4, AddressFamily::Inet6, &FilterSpec::new(0).protocol(proto::TCP)).unwrap();

    let src: Ipv6Addr = "2001:db8::10".parse().unwrap();
    let dst: Ipv6Addr = "2001:db8::20".parse().unwrap();

    let mut ack = tcp_v6(src, dst, 50000, 443, TcpFlags::ACK, 0);
    ctx.mark_packet(&mut ack);
    assert_eq!(ack.mark(), 4);

    let ack_queue = ctx.get_bearer_map(9).unwrap().ack_queue_index.unwrap();
    assert_eq!(ack_queue, 3 + ACK_MQ_OFFSET);
    assert_eq!(ctx.select_queue(&ack), ack_queue);

    let mut data = tcp_v6(src, dst, 50000, 443, TcpFlags::ACK | TcpFlags::PSH, 512);
    ctx.mark_packet(&mut data);
    assert_eq!(ctx.select_queue(&data), 3);
}

#[tokio::test(start_paused = true)]
async fn flow_id_mode_unmarked_packets() {
    let (ctx, _queues) = context(DfcMode::FlowId);

    let ack = tcp_v4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, TcpFlags::ACK, 0);
    let syn = tcp_v4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, 2, TcpFlags::SYN, 0);
    assert_eq!(ctx.select_queue(&ack), DEFAULT_ACK_MQ_NUM);
    assert_eq!(ctx.select_queue(&syn), DEFAULT_MQ_NUM);
}
