//! The six literal end-to-end scenarios plus the bypass-CIDR enforcement
//! scenario, each wiring detector -> parser -> session together since no
//! single unit owns that seam.

use std::net::Ipv4Addr;
use std::sync::Arc;

use dlp_core::interceptor::filter::{is_bypassed, parse_bypass_cidrs};
use dlp_core::model::{Direction, InterceptMode, L4Protocol, PacketInfo, ProcessInfo, ReinjectHandle};
use dlp_core::parsers::{ParserManager, ProtocolDetector};
use dlp_core::pipeline::Pipeline;
use dlp_core::session::SessionManager;

fn packet(dst_port: u16, payload: &[u8]) -> PacketInfo {
    PacketInfo::new(
        1,
        Direction::Outbound,
        L4Protocol::Tcp,
        Ipv4Addr::new(10, 0, 0, 1),
        50000,
        Ipv4Addr::new(93, 184, 216, 34),
        dst_port,
        payload.to_vec(),
        ReinjectHandle::None,
    )
}

#[test]
fn scenario_1_http_get_on_port_80() {
    let payload = b"GET /api/users HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let pkt = packet(80, payload);

    assert_eq!(ProtocolDetector::detect(&pkt.payload, pkt.dst_port), "http");

    let manager = ParserManager::new();
    let data = manager.process(&pkt);
    assert_eq!(data.protocol, "http");
    assert_eq!(data.method.as_deref(), Some("GET"));
    assert_eq!(data.url.as_deref(), Some("/api/users"));
    assert_eq!(data.headers.get("Host").map(String::as_str), Some("example.com"));
}

#[test]
fn scenario_2_tls_client_hello_on_port_443() {
    let payload: Vec<u8> = vec![0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00, 0x00, 0x01, 0x00];
    let pkt = packet(443, &payload);

    assert_eq!(ProtocolDetector::detect(&pkt.payload, pkt.dst_port), "https");

    let manager = ParserManager::new();
    let data = manager.process(&pkt);
    assert_eq!(data.metadata.get("content_type").and_then(|v| v.as_u64()), Some(22));
    let version = data.metadata.get("version").and_then(|v| v.as_u64()).unwrap();
    assert!((0x0301..=0x0304).contains(&version));
    assert_eq!(data.metadata.get("handshake_type").and_then(|v| v.as_u64()), Some(1));
}

#[test]
fn scenario_3_ftp_port_command() {
    let payload = b"PORT 192,168,1,100,20,0\r\n";
    let pkt = packet(21, payload);

    assert_eq!(ProtocolDetector::detect(&pkt.payload, pkt.dst_port), "ftp");

    let manager = ParserManager::new();
    let data = manager.process(&pkt);
    assert_eq!(data.protocol, "ftp");
    assert_eq!(
        data.metadata.get("data_connection").and_then(|v| v.as_str()),
        Some("192.168.1.100:5120")
    );
}

#[test]
fn scenario_4_smtp_helo() {
    let payload = b"HELO example.com\r\n";
    let pkt = packet(25, payload);

    assert_eq!(ProtocolDetector::detect(&pkt.payload, pkt.dst_port), "smtp");

    let manager = ParserManager::new();
    let data = manager.process(&pkt);
    assert_eq!(data.metadata.get("command").and_then(|v| v.as_str()), Some("HELO"));
    assert_eq!(data.metadata.get("state").and_then(|v| v.as_str()), Some("Greeting"));
}

#[test]
fn scenario_5_mysql_handshake() {
    // Handshake packet: 3-byte length + 1-byte sequence, then protocol
    // version 0x0a followed by a null-terminated server version string.
    let mut body = vec![0x0a];
    body.extend_from_slice(b"5.7.29");
    body.push(0);
    body.extend_from_slice(&[0u8; 20]); // thread id + auth-plugin-data stub
    let mut payload = Vec::new();
    let len = body.len() as u32;
    payload.extend_from_slice(&len.to_le_bytes()[..3]);
    payload.push(0);
    payload.extend_from_slice(&body);

    let pkt = packet(3306, &payload);
    assert_eq!(ProtocolDetector::detect(&pkt.payload, pkt.dst_port), "mysql");

    let manager = ParserManager::new();
    let data = manager.process(&pkt);
    assert_eq!(data.metadata.get("packet_type").and_then(|v| v.as_str()), Some("handshake"));
    assert_eq!(data.metadata.get("server_version").and_then(|v| v.as_str()), Some("5.7.29"));
}

#[test]
fn scenario_6_bypass_cidr_enforcement() {
    let bypass = parse_bypass_cidrs(&["10.0.0.0/8".to_string()]);
    let mut pkt = packet(80, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");
    pkt.dst_ip = Ipv4Addr::new(10, 1, 2, 3);

    // Mirrors every capture backend's post-kernel-filter recheck: a packet
    // whose destination falls in a bypass CIDR never reaches the analysis
    // stream, regardless of how well-formed its payload is.
    assert!(is_bypassed(pkt.dst_ip, &bypass));
}

#[test]
fn round_trip_ftp_username_and_password() {
    let manager = ParserManager::new();

    let user_data = manager.process(&packet(21, b"USER alice\r\n"));
    assert_eq!(user_data.headers.get("Username").map(String::as_str), Some("alice"));

    let pass_data = manager.process(&packet(21, b"PASS s3cret\r\n"));
    assert_eq!(pass_data.headers.get("Password").map(String::as_str), Some("***REDACTED***"));
}

#[tokio::test]
async fn pipeline_worker_consumes_channel_and_shuts_down_on_close() {
    let config = dlp_core::config::RuntimeConfig::default();
    let session_manager = Arc::new(SessionManager::default());
    let parser_manager = Arc::new(ParserManager::new());
    let pipeline = Arc::new(Pipeline::new(&config, Arc::clone(&parser_manager), Arc::clone(&session_manager)));

    struct NullSink;
    impl dlp_core::interceptor::VerdictSink for NullSink {
        fn reinject(&self, _packet: &PacketInfo) -> dlp_core::error::Result<()> {
            Ok(())
        }

        fn drop_packet(&self, _packet: &PacketInfo) -> dlp_core::error::Result<()> {
            Ok(())
        }
    }

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let sink: Arc<dyn dlp_core::interceptor::VerdictSink> = Arc::new(NullSink);
    let workers = pipeline.spawn_workers(rx, sink, 2);

    tx.send(packet(80, b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")).await.unwrap();
    drop(tx);

    for handle in workers {
        handle.await.unwrap();
    }

    assert_eq!(session_manager.len(), 1);
    assert_eq!(pipeline.stats().parsed.load(std::sync::atomic::Ordering::Relaxed), 1);
}
