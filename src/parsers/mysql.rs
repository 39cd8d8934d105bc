//! MySQL wire protocol: length-prefixed packet framing, handshake/OK/error
//! discrimination, and `COM_QUERY` text extraction/classification.

use crate::model::PacketInfo;

use super::{ParseError, ParserInfo, ProtocolParser};

const COM_QUERY: u8 = 0x03;
const LAST_KNOWN_COMMAND_CODE: u8 = 0x1f;

const SENSITIVE_KEYWORDS: &[&str] = &["password", "ssn", "credit_card", "secret", "token"];

struct MysqlPacket<'a> {
    #[allow(dead_code)]
    length: u32,
    #[allow(dead_code)]
    sequence: u8,
    payload: &'a [u8],
}

fn frame(payload: &[u8]) -> Option<MysqlPacket<'_>> {
    if payload.len() < 4 {
        return None;
    }
    let length = u32::from_le_bytes([payload[0], payload[1], payload[2], 0]);
    let sequence = payload[3];
    let body_end = (4 + length as usize).min(payload.len());
    Some(MysqlPacket { length, sequence, payload: &payload[4..body_end] })
}

/// Handshake signature: sequence 0, protocol version byte `0x0a`, followed
/// by a null-terminated printable version string 3-20 bytes long.
pub fn looks_like_handshake(payload: &[u8]) -> bool {
    let Some(pkt) = frame(payload) else { return false };
    if pkt.sequence != 0 {
        return false;
    }
    let body = pkt.payload;
    if body.first() != Some(&0x0a) {
        return false;
    }
    let Some(nul_at) = body[1..].iter().position(|&b| b == 0) else { return false };
    let version_len = nul_at;
    (3..=20).contains(&version_len) && body[1..1 + version_len].iter().all(|&b| b.is_ascii_graphic() || b == b'.')
}

pub fn looks_like_command(payload: &[u8]) -> bool {
    let Some(pkt) = frame(payload) else { return false };
    pkt.payload.first().map(|&b| b <= LAST_KNOWN_COMMAND_CODE).unwrap_or(false)
}

fn classify_query(sql: &str) -> &'static str {
    let upper = sql.trim_start().to_uppercase();
    for (prefix, tag) in [
        ("SELECT", "SELECT"),
        ("INSERT", "INSERT"),
        ("UPDATE", "UPDATE"),
        ("DELETE", "DELETE"),
        ("CREATE", "CREATE"),
        ("DROP", "DROP"),
        ("ALTER", "ALTER"),
    ] {
        if upper.starts_with(prefix) {
            return tag;
        }
    }
    "OTHER"
}

/// Pulls bare identifiers out of `FROM`/`INTO`/`UPDATE`/`JOIN` clauses — a
/// simple regex-equivalent scan, not a real SQL parser.
fn extract_table_names(sql: &str) -> Vec<String> {
    let upper = sql.to_uppercase();
    let mut tables = Vec::new();
    for marker in ["FROM", "INTO", "UPDATE", "JOIN"] {
        let mut search_from = 0;
        while let Some(pos) = upper[search_from..].find(marker) {
            let abs = search_from + pos + marker.len();
            let rest = sql[abs..].trim_start();
            if let Some(name) = rest.split(|c: char| c.is_whitespace() || c == ',' || c == '(' || c == ';').next() {
                if !name.is_empty() {
                    tables.push(name.trim_matches('`').to_string());
                }
            }
            search_from = abs;
        }
    }
    tables
}

fn flag_sensitive_keywords(sql: &str) -> Vec<String> {
    let lower = sql.to_lowercase();
    SENSITIVE_KEYWORDS.iter().filter(|kw| lower.contains(**kw)).map(|s| s.to_string()).collect()
}

pub struct MysqlParser;

impl MysqlParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MysqlParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolParser for MysqlParser {
    fn info(&self) -> ParserInfo {
        ParserInfo { name: "mysql", version: "1.0", protocols: &["mysql"] }
    }

    fn can_parse(&self, packet: &PacketInfo) -> bool {
        (packet.dst_port == 3306 || packet.src_port == 3306)
            && (looks_like_handshake(&packet.payload) || looks_like_command(&packet.payload))
    }

    fn parse(&self, packet: &PacketInfo) -> Result<crate::model::ParsedData, ParseError> {
        let pkt = frame(&packet.payload).ok_or_else(|| ParseError::new("mysql", "payload shorter than 4-byte header"))?;
        let mut data = crate::model::ParsedData::new("mysql");
        let body = pkt.payload;

        if body.is_empty() {
            return Err(ParseError::new("mysql", "empty packet body"));
        }

        if looks_like_handshake(&packet.payload) {
            data.metadata.insert("packet_type".into(), serde_json::json!("handshake"));
            if let Some(nul_at) = body[1..].iter().position(|&b| b == 0) {
                let version = String::from_utf8_lossy(&body[1..1 + nul_at]).to_string();
                data.metadata.insert("server_version".into(), serde_json::json!(version));
            }
        } else if body[0] == 0x00 && body.len() >= 7 {
            data.metadata.insert("packet_type".into(), serde_json::json!("ok"));
        } else if body[0] == 0xff {
            data.metadata.insert("packet_type".into(), serde_json::json!("error"));
        } else if body[0] <= LAST_KNOWN_COMMAND_CODE {
            data.metadata.insert("packet_type".into(), serde_json::json!("command"));
            if body[0] == COM_QUERY {
                let sql = String::from_utf8_lossy(&body[1..]).to_string();
                data.metadata.insert("query_type".into(), serde_json::json!(classify_query(&sql)));
                data.metadata.insert("tables".into(), serde_json::json!(extract_table_names(&sql)));
                let flagged = flag_sensitive_keywords(&sql);
                if !flagged.is_empty() {
                    data.metadata.insert("sensitive_keywords".into(), serde_json::json!(flagged));
                }
                data.body = sql.into_bytes();
            }
        } else {
            return Err(ParseError::new("mysql", "unrecognized packet shape"));
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, L4Protocol, ReinjectHandle};
    use std::net::Ipv4Addr;

    fn packet(body: &[u8]) -> PacketInfo {
        let mut payload = Vec::new();
        let len = body.len() as u32;
        payload.extend_from_slice(&len.to_le_bytes()[..3]);
        payload.push(0);
        payload.extend_from_slice(body);
        PacketInfo::new(
            1,
            Direction::Outbound,
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            Ipv4Addr::new(1, 2, 3, 4),
            3306,
            payload,
            ReinjectHandle::None,
        )
    }

    fn handshake_packet(version: &str) -> PacketInfo {
        let mut body = vec![0x0a];
        body.extend_from_slice(version.as_bytes());
        body.push(0);
        body.extend_from_slice(&[0u8; 10]); // thread id + salt stub
        packet(&body)
    }

    #[test]
    fn test_handshake_extracts_server_version() {
        let parser = MysqlParser::new();
        let pkt = handshake_packet("5.7.29");
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.metadata.get("server_version").and_then(|v| v.as_str()), Some("5.7.29"));
        assert_eq!(data.metadata.get("packet_type").and_then(|v| v.as_str()), Some("handshake"));
    }

    #[test]
    fn test_com_query_classifies_select() {
        let parser = MysqlParser::new();
        let mut body = vec![COM_QUERY];
        body.extend_from_slice(b"SELECT * FROM users WHERE id = 1");
        let pkt = packet(&body);
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.metadata.get("query_type").and_then(|v| v.as_str()), Some("SELECT"));
        let tables = data.metadata.get("tables").and_then(|v| v.as_array()).unwrap();
        assert!(tables.iter().any(|t| t.as_str() == Some("users")));
    }

    #[test]
    fn test_com_query_flags_sensitive_keywords() {
        let parser = MysqlParser::new();
        let mut body = vec![COM_QUERY];
        body.extend_from_slice(b"SELECT password FROM accounts");
        let pkt = packet(&body);
        let data = parser.parse(&pkt).unwrap();
        let flagged = data.metadata.get("sensitive_keywords").and_then(|v| v.as_array()).unwrap();
        assert!(flagged.iter().any(|k| k.as_str() == Some("password")));
    }

    #[test]
    fn test_error_packet_detected() {
        let parser = MysqlParser::new();
        let mut body = vec![0xff];
        body.extend_from_slice(&[0x10, 0x04]);
        body.extend_from_slice(b"Access denied");
        let pkt = packet(&body);
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.metadata.get("packet_type").and_then(|v| v.as_str()), Some("error"));
    }

    #[test]
    fn test_looks_like_handshake_rejects_non_handshake() {
        assert!(!looks_like_handshake(b"\x01\x00\x00\x00\x03SELECT 1"));
    }
}
