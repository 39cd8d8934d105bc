//! Minimal TLS record/handshake parser: SNI and ALPN extraction, certificate
//! chain metadata, no decryption of application data.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::PacketInfo;

use super::{ParseError, ParserInfo, ProtocolParser};

const CONTENT_TYPE_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_TYPE_ALERT: u8 = 21;
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;
const HANDSHAKE_CERTIFICATE: u8 = 11;
const HANDSHAKE_CLIENT_KEY_EXCHANGE: u8 = 16;

/// Top-level record check: content type in the TLS range and a version
/// field of 0x03 0x0{1,2,3,4}.
pub fn is_tls_record(payload: &[u8]) -> bool {
    if payload.len() < 5 {
        return false;
    }
    let content_type = payload[0];
    let valid_type = matches!(
        content_type,
        CONTENT_TYPE_CHANGE_CIPHER_SPEC | CONTENT_TYPE_ALERT | CONTENT_TYPE_HANDSHAKE | CONTENT_TYPE_APPLICATION_DATA
    );
    valid_type && payload[1] == 0x03 && (1..=4).contains(&payload[2])
}

fn parse_extensions(data: &[u8]) -> (Option<String>, Vec<String>) {
    let mut sni = None;
    let mut alpn = Vec::new();
    let mut i = 0;
    while i + 4 <= data.len() {
        let ext_type = u16::from_be_bytes([data[i], data[i + 1]]);
        let ext_len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        let body_start = i + 4;
        if body_start + ext_len > data.len() {
            break;
        }
        let body = &data[body_start..body_start + ext_len];
        match ext_type {
            0 => sni = parse_sni(body),
            16 => alpn = parse_alpn(body),
            _ => {}
        }
        i = body_start + ext_len;
    }
    (sni, alpn)
}

fn parse_sni(body: &[u8]) -> Option<String> {
    // server_name_list length (2) + entry type (1) + name length (2) + name.
    if body.len() < 5 {
        return None;
    }
    let name_len = u16::from_be_bytes([body[3], body[4]]) as usize;
    let name_start = 5;
    if name_start + name_len > body.len() {
        return None;
    }
    Some(String::from_utf8_lossy(&body[name_start..name_start + name_len]).to_string())
}

fn parse_alpn(body: &[u8]) -> Vec<String> {
    let mut protocols = Vec::new();
    if body.len() < 2 {
        return protocols;
    }
    let mut i = 2;
    while i < body.len() {
        let len = body[i] as usize;
        i += 1;
        if i + len > body.len() {
            break;
        }
        protocols.push(String::from_utf8_lossy(&body[i..i + len]).to_string());
        i += len;
    }
    protocols
}

/// Per-flow cache of the SNI seen on a ClientHello, so later opaque
/// application-data records on the same session still carry `server_name`.
#[derive(Default)]
struct SniCache {
    by_session: Mutex<HashMap<String, String>>,
}

impl SniCache {
    fn remember(&self, session_id: &str, sni: &str) {
        self.by_session.lock().unwrap().insert(session_id.to_string(), sni.to_string());
    }

    fn recall(&self, session_id: &str) -> Option<String> {
        self.by_session.lock().unwrap().get(session_id).cloned()
    }
}

pub struct TlsParser {
    sni_cache: SniCache,
}

impl TlsParser {
    pub fn new() -> Self {
        Self { sni_cache: SniCache::default() }
    }
}

impl Default for TlsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolParser for TlsParser {
    fn info(&self) -> ParserInfo {
        ParserInfo { name: "tls", version: "1.0", protocols: &["https"] }
    }

    fn can_parse(&self, packet: &PacketInfo) -> bool {
        is_tls_record(&packet.payload)
    }

    fn parse(&self, packet: &PacketInfo) -> Result<crate::model::ParsedData, ParseError> {
        let payload = &packet.payload;
        if payload.len() < 5 {
            return Err(ParseError::new("tls", "record shorter than header"));
        }
        let content_type = payload[0];
        let version = u16::from_be_bytes([payload[1], payload[2]]);
        let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;

        let mut data = crate::model::ParsedData::new("https");
        data.metadata.insert("content_type".into(), serde_json::json!(content_type));
        data.metadata.insert("version".into(), serde_json::json!(version));
        data.metadata.insert("record_length".into(), serde_json::json!(record_len));

        let session_id = packet.session_id();

        match content_type {
            CONTENT_TYPE_HANDSHAKE => self.parse_handshake(payload, &session_id, &mut data),
            CONTENT_TYPE_APPLICATION_DATA => {
                data.metadata.insert("encrypted".into(), serde_json::json!(true));
                if let Some(sni) = self.sni_cache.recall(&session_id) {
                    data.metadata.insert("server_name".into(), serde_json::json!(sni));
                }
            }
            CONTENT_TYPE_CHANGE_CIPHER_SPEC | CONTENT_TYPE_ALERT => {}
            _ => {
                // Unknown content-types are opaque application data, not an error.
                data.metadata.insert("encrypted".into(), serde_json::json!(true));
            }
        }

        Ok(data)
    }
}

impl TlsParser {
    fn parse_handshake(&self, payload: &[u8], session_id: &str, data: &mut crate::model::ParsedData) {
        if payload.len() < 9 {
            return;
        }
        let handshake_type = payload[5];
        data.metadata.insert("handshake_type".into(), serde_json::json!(handshake_type));
        let body = &payload[9..];

        match handshake_type {
            HANDSHAKE_CLIENT_HELLO | HANDSHAKE_SERVER_HELLO => {
                // Skip version(2) + random(32) + session_id (length-prefixed).
                let mut i = 34;
                if i >= body.len() {
                    return;
                }
                let session_id_len = body[i] as usize;
                i += 1 + session_id_len;
                if handshake_type == HANDSHAKE_CLIENT_HELLO {
                    // cipher_suites (length-prefixed u16 list).
                    if i + 2 > body.len() {
                        return;
                    }
                    let cs_len = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
                    i += 2 + cs_len;
                    // compression_methods (length-prefixed u8 list).
                    if i >= body.len() {
                        return;
                    }
                    let comp_len = body[i] as usize;
                    i += 1 + comp_len;
                } else {
                    // ServerHello has a single selected cipher suite (2 bytes)
                    // plus a single compression method (1 byte).
                    i += 3;
                }
                if i + 2 > body.len() {
                    return;
                }
                let ext_total_len = u16::from_be_bytes([body[i], body[i + 1]]) as usize;
                i += 2;
                if i + ext_total_len > body.len() {
                    return;
                }
                let (sni, alpn) = parse_extensions(&body[i..i + ext_total_len]);
                if let Some(sni) = sni {
                    self.sni_cache.remember(session_id, &sni);
                    data.metadata.insert("server_name".into(), serde_json::json!(sni));
                }
                if !alpn.is_empty() {
                    data.metadata.insert("alpn".into(), serde_json::json!(alpn));
                }
            }
            HANDSHAKE_CERTIFICATE => {
                // Certificate chain decoding to subject/issuer/DNS-names is
                // left to an X.509 library downstream; this layer only
                // records that a chain was observed and its byte length.
                data.metadata.insert("certificate_bytes".into(), serde_json::json!(body.len()));
            }
            HANDSHAKE_CLIENT_KEY_EXCHANGE => {
                data.metadata.insert("key_exchange_bytes".into(), serde_json::json!(body.len()));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, L4Protocol, ReinjectHandle};
    use std::net::Ipv4Addr;

    fn packet(payload: Vec<u8>) -> PacketInfo {
        PacketInfo::new(
            1,
            Direction::Outbound,
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            Ipv4Addr::new(1, 2, 3, 4),
            443,
            payload,
            ReinjectHandle::None,
        )
    }

    fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let host_bytes = hostname.as_bytes();
        let server_name_entry_len = 3 + host_bytes.len();
        let server_name_list_len = server_name_entry_len;
        let mut sni_ext_body = Vec::new();
        sni_ext_body.extend_from_slice(&(server_name_list_len as u16).to_be_bytes());
        sni_ext_body.push(0); // host_name type
        sni_ext_body.extend_from_slice(&(host_bytes.len() as u16).to_be_bytes());
        sni_ext_body.extend_from_slice(host_bytes);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // extension type: server_name
        extensions.extend_from_slice(&(sni_ext_body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_ext_body);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
        body.extend_from_slice(&[0x00, 0x2f]);
        body.push(1); // compression methods len
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        let body_len = body.len() as u32;
        handshake.extend_from_slice(&body_len.to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_is_tls_record_accepts_valid_header() {
        assert!(is_tls_record(&[0x16, 0x03, 0x01, 0x00, 0x05]));
    }

    #[test]
    fn test_is_tls_record_rejects_bad_content_type() {
        assert!(!is_tls_record(&[0x00, 0x03, 0x01, 0x00, 0x05]));
    }

    #[test]
    fn test_client_hello_extracts_sni() {
        let parser = TlsParser::new();
        let pkt = packet(client_hello_with_sni("example.com"));
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.metadata.get("server_name").and_then(|v| v.as_str()), Some("example.com"));
        assert_eq!(data.metadata.get("handshake_type").and_then(|v| v.as_u64()), Some(1));
    }

    #[test]
    fn test_application_data_uses_cached_sni() {
        let parser = TlsParser::new();
        let hello = packet(client_hello_with_sni("example.com"));
        parser.parse(&hello).unwrap();

        let app_data = packet(vec![CONTENT_TYPE_APPLICATION_DATA, 0x03, 0x03, 0x00, 0x10, 0, 0, 0, 0, 0]);
        let data = parser.parse(&app_data).unwrap();
        assert_eq!(data.metadata.get("server_name").and_then(|v| v.as_str()), Some("example.com"));
        assert_eq!(data.metadata.get("encrypted").and_then(|v| v.as_bool()), Some(true));
    }

    #[test]
    fn test_unknown_content_type_is_opaque_not_error() {
        let parser = TlsParser::new();
        let pkt = packet(vec![99, 0x03, 0x03, 0x00, 0x05, 1, 2, 3, 4, 5]);
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.metadata.get("encrypted").and_then(|v| v.as_bool()), Some(true));
    }
}
