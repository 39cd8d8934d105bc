//! HTTP/1.x request and response parsing.

use std::collections::HashMap;

use crate::model::PacketInfo;

use super::{ParseError, ParserInfo, ProtocolParser};

const MAX_BODY_SIZE: usize = 64 * 1024;

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// Strict check: a recognized method followed by a path and `HTTP/1.x` or
/// `HTTP/2`, on the request line, or a `HTTP/1.x NNN` status line.
pub fn is_http_strict(payload: &[u8]) -> bool {
    let Some(line) = first_line(payload) else {
        return false;
    };
    if line.starts_with("HTTP/1.") || line.starts_with("HTTP/2") {
        return line.splitn(3, ' ').nth(1).map(|s| s.len() == 3 && s.chars().all(|c| c.is_ascii_digit())).unwrap_or(false);
    }
    let mut parts = line.splitn(3, ' ');
    let Some(method) = parts.next() else { return false };
    if !METHODS.contains(&method) {
        return false;
    }
    matches!(parts.next(), Some(_)) && parts.next().map(|v| v.starts_with("HTTP/1.") || v.starts_with("HTTP/2")).unwrap_or(false)
}

/// Loose check: common header names appear even without a well-formed
/// request/status line (e.g. a mid-stream continuation).
pub fn is_http_loose(payload: &[u8]) -> bool {
    let text = String::from_utf8_lossy(payload);
    text.contains("Host:") || text.contains("User-Agent:") || text.contains("Content-Type:")
}

fn first_line(payload: &[u8]) -> Option<String> {
    let end = payload.iter().position(|&b| b == b'\r' || b == b'\n')?;
    Some(String::from_utf8_lossy(&payload[..end]).to_string())
}

enum StartLine {
    Request { method: String, url: String },
    Response { status_code: u16 },
}

fn parse_start_line(line: &str) -> Option<StartLine> {
    if line.starts_with("HTTP/1.") || line.starts_with("HTTP/2") {
        let mut parts = line.splitn(3, ' ');
        parts.next()?;
        let code = parts.next()?.parse::<u16>().ok()?;
        return Some(StartLine::Response { status_code: code });
    }
    let mut parts = line.splitn(3, ' ');
    let method = parts.next()?.to_string();
    let url = parts.next()?.to_string();
    Some(StartLine::Request { method, url })
}

fn parse_headers(lines: &[&str]) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    headers
}

pub struct HttpParser;

impl HttpParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolParser for HttpParser {
    fn info(&self) -> ParserInfo {
        ParserInfo { name: "http", version: "1.0", protocols: &["http"] }
    }

    fn can_parse(&self, packet: &PacketInfo) -> bool {
        is_http_strict(&packet.payload) || is_http_loose(&packet.payload)
    }

    fn parse(&self, packet: &PacketInfo) -> Result<crate::model::ParsedData, ParseError> {
        let text = String::from_utf8_lossy(&packet.payload);
        let mut lines = text.split("\r\n");
        let start_line = lines.next().ok_or_else(|| ParseError::new("http", "empty payload"))?;
        let rest: Vec<&str> = lines.collect();

        let mut data = crate::model::ParsedData::new("http");
        data.headers = parse_headers(&rest);

        match parse_start_line(start_line) {
            Some(StartLine::Request { method, url }) => {
                data.method = Some(method);
                data.url = Some(url);
            }
            Some(StartLine::Response { status_code }) => {
                data.status_code = Some(status_code);
            }
            None => return Err(ParseError::new("http", "malformed start line")),
        }

        data.content_type = data.headers.get("Content-Type").cloned();

        // Body is whatever follows the blank-line header terminator,
        // bounded to avoid holding an unbounded buffer for chunked bodies
        // this single-packet parser cannot reassemble.
        if let Some(split_at) = text.find("\r\n\r\n") {
            let body_start = split_at + 4;
            if body_start < packet.payload.len() {
                let end = (body_start + MAX_BODY_SIZE).min(packet.payload.len());
                data.body = packet.payload[body_start..end].to_vec();
            }
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, L4Protocol, ReinjectHandle};
    use std::net::Ipv4Addr;

    fn packet(payload: &[u8]) -> PacketInfo {
        PacketInfo::new(
            1,
            Direction::Outbound,
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            Ipv4Addr::new(1, 2, 3, 4),
            80,
            payload.to_vec(),
            ReinjectHandle::None,
        )
    }

    #[test]
    fn test_parses_get_request() {
        let parser = HttpParser::new();
        let pkt = packet(b"GET /api/users HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.method.as_deref(), Some("GET"));
        assert_eq!(data.url.as_deref(), Some("/api/users"));
        assert_eq!(data.headers.get("Host").map(String::as_str), Some("example.com"));
    }

    #[test]
    fn test_parses_response_status_code() {
        let parser = HttpParser::new();
        let pkt = packet(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html></html>");
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.status_code, Some(200));
        assert_eq!(data.content_type.as_deref(), Some("text/html"));
        assert_eq!(data.body, b"<html></html>");
    }

    #[test]
    fn test_can_parse_rejects_non_http() {
        let parser = HttpParser::new();
        let pkt = packet(b"\x16\x03\x01\x00\x05");
        assert!(!parser.can_parse(&pkt));
    }

    #[test]
    fn test_strict_check_requires_version_token() {
        assert!(!is_http_strict(b"GET /foo bar"));
        assert!(is_http_strict(b"GET /foo HTTP/1.1\r\n"));
    }
}
