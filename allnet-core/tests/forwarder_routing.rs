#![forbid(unsafe_code)]

//! End-to-end routing behavior driven through the forwarder's public
//! surface (`attach`/`run`) rather than its private `handle_frame`, using
//! real `tokio::io::duplex` pipes the way `tcp_basic.rs`'s proxy tests drive
//! a listener with real `TcpStream`s instead of calling handler internals.

use std::time::Duration;

use allnet_core::bloom::PidCache;
use allnet_core::forwarder::{Forwarder, PipeLabel};
use allnet_core::packet::{Header, Packet, PacketType, ALLNET_VERSION};
use allnet_core::pipe::framing::{self, FrameReader, RecvOutcome, PRIORITY_MAX};
use allnet_core::rate::SourceRateTracker;
use tokio::io::{duplex, split};
use tokio::sync::watch;
use tokio::time::timeout;

fn sample_packet(source: u8) -> Vec<u8> {
    let header = Header {
        version: ALLNET_VERSION,
        packet_type: PacketType::Data,
        hop_count: 0,
        max_hops: 10,
        source_nbits: 8,
        destination_nbits: 0,
        sig_algo: 0,
        transport: 0,
        source: [source, 0, 0, 0, 0, 0, 0, 0],
        destination: [0; 8],
        message_id: None,
        expiration_ms: None,
    };
    Packet { header, payload: vec![7u8; 32] }.encode()
}

fn new_forwarder() -> Forwarder {
    let pid_cache = PidCache::new(4, 4096, 4);
    let rate_tracker = SourceRateTracker::new(Duration::from_secs(10), 64);
    Forwarder::new(pid_cache, rate_tracker)
}

#[tokio::test]
async fn fans_out_to_every_pipe_but_the_origin_and_records_metrics() {
    let mut forwarder = new_forwarder();
    let metrics = forwarder.metrics();

    let (cache_client, cache_server) = duplex(65536);
    let (local_client, local_server) = duplex(65536);
    let (ip_client, ip_server) = duplex(65536);
    let (wireless_client, wireless_server) = duplex(65536);

    let (cache_r, cache_w) = split(cache_server);
    let (local_r, local_w) = split(local_server);
    let (ip_r, ip_w) = split(ip_server);
    let (wireless_r, wireless_w) = split(wireless_server);

    forwarder.attach(PipeLabel::Cache, cache_r, Box::new(cache_w));
    forwarder.attach(PipeLabel::LocalGateway, local_r, Box::new(local_w));
    forwarder.attach(PipeLabel::IpGateway, ip_r, Box::new(ip_w));
    forwarder.attach(PipeLabel::Wireless(0), wireless_r, Box::new(wireless_w));

    let (_tx, rx) = watch::channel(false);
    let run = tokio::spawn(async move { forwarder.run(rx).await });

    let mut cache_reader = FrameReader::new(cache_client);
    let mut local_reader = FrameReader::new(local_client);
    let mut wireless_reader = FrameReader::new(wireless_client);

    let mut ip_writer = ip_client;
    framing::send(&mut ip_writer, &sample_packet(1), PRIORITY_MAX).await.unwrap();

    for reader in [&mut cache_reader, &mut local_reader, &mut wireless_reader] {
        let outcome = timeout(Duration::from_secs(1), reader.recv()).await.unwrap().unwrap();
        match outcome {
            RecvOutcome::Frame { payload, .. } => {
                let packet = Packet::parse(&payload).unwrap();
                assert_eq!(packet.header.hop_count, 1, "forwarded copy's hop count should increment");
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    // Nothing was ever written back to the ip gateway pipe; dropping the
    // write side after the loop would surface a panic if the forwarder had
    // tried (and failed) to hairpin a frame back to its origin.
    drop(ip_writer);
    run.abort();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.forwarded, 1);
    assert_eq!(snapshot.dropped_duplicate, 0);
}

#[tokio::test]
async fn second_delivery_of_the_same_packet_is_counted_as_a_duplicate() {
    let mut forwarder = new_forwarder();
    let metrics = forwarder.metrics();

    let (_cache_client, cache_server) = duplex(65536);
    let (_local_client, local_server) = duplex(65536);
    let (ip_client, ip_server) = duplex(65536);

    forwarder.attach(PipeLabel::Cache, cache_server, Box::new(tokio::io::sink()));
    forwarder.attach(PipeLabel::LocalGateway, local_server, Box::new(tokio::io::sink()));
    forwarder.attach(PipeLabel::IpGateway, ip_server, Box::new(tokio::io::sink()));

    let (_tx, rx) = watch::channel(false);
    let run = tokio::spawn(async move { forwarder.run(rx).await });

    let mut ip_writer = ip_client;
    let payload = sample_packet(9);
    framing::send(&mut ip_writer, &payload, PRIORITY_MAX).await.unwrap();
    framing::send(&mut ip_writer, &payload, PRIORITY_MAX).await.unwrap();

    // Give the routing loop a moment to process both frames.
    tokio::time::sleep(Duration::from_millis(100)).await;
    run.abort();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.forwarded, 1);
    assert_eq!(snapshot.dropped_duplicate, 1);
}
