//! FTP control-channel parser: command verbs, 3-digit response codes with
//! `-` continuation, username/password capture (password redacted), and
//! `PORT` argument decoding for the secondary data connection.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::PacketInfo;

use super::{ParseError, ParserInfo, ProtocolParser};

const CONTROL_PORT: u16 = 21;

const COMMAND_VERBS: &[&str] = &[
    "USER", "PASS", "ACCT", "CWD", "CDUP", "SMNT", "QUIT", "REIN", "PORT", "PASV", "TYPE",
    "STRU", "MODE", "RETR", "STOR", "STOU", "APPE", "ALLO", "REST", "RNFR", "RNTO", "ABOR",
    "DELE", "RMD", "MKD", "PWD", "LIST", "NLST", "SITE", "SYST", "STAT", "HELP", "NOOP",
];

pub fn is_ftp_control(payload: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else { return false };
    let line = text.lines().next().unwrap_or("");
    if line.len() >= 3 && line.as_bytes()[..3].iter().all(|b| b.is_ascii_digit()) {
        return true;
    }
    let verb = line.split_whitespace().next().unwrap_or("").to_uppercase();
    COMMAND_VERBS.contains(&verb.as_str())
}

#[derive(Debug, Clone, Default)]
struct FtpSessionState {
    current_directory: String,
    transfer_mode: String,
    last_command: String,
    data_connection: Option<String>,
}

#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<String, FtpSessionState>>,
}

impl SessionTable {
    fn with_session<F: FnOnce(&mut FtpSessionState)>(&self, session_id: &str, f: F) -> FtpSessionState {
        let mut sessions = self.sessions.lock().unwrap();
        let entry = sessions.entry(session_id.to_string()).or_default();
        f(entry);
        entry.clone()
    }
}

/// Decodes a `PORT h1,h2,h3,h4,p1,p2` argument into `"h1.h2.h3.h4:port"`.
fn decode_port_command(args: &str) -> Option<String> {
    let parts: Vec<u16> = args.split(',').filter_map(|s| s.trim().parse().ok()).collect();
    if parts.len() != 6 {
        return None;
    }
    let ip = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]);
    let port = parts[4] * 256 + parts[5];
    Some(format!("{ip}:{port}"))
}

pub struct FtpParser {
    sessions: SessionTable,
}

impl FtpParser {
    pub fn new() -> Self {
        Self { sessions: SessionTable::default() }
    }
}

impl Default for FtpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolParser for FtpParser {
    fn info(&self) -> ParserInfo {
        ParserInfo { name: "ftp", version: "1.0", protocols: &["ftp"] }
    }

    fn can_parse(&self, packet: &PacketInfo) -> bool {
        (packet.dst_port == CONTROL_PORT || packet.src_port == CONTROL_PORT) && is_ftp_control(&packet.payload)
    }

    fn parse(&self, packet: &PacketInfo) -> Result<crate::model::ParsedData, ParseError> {
        let text = String::from_utf8_lossy(&packet.payload);
        let session_id = packet.session_id();
        let mut data = crate::model::ParsedData::new("ftp");

        for raw_line in text.lines() {
            let line = raw_line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            if line.len() >= 3 && line.as_bytes()[..3].iter().all(|b| b.is_ascii_digit()) {
                let code: u16 = line[..3].parse().unwrap_or(0);
                let continuation = line.as_bytes().get(3) == Some(&b'-');
                data.metadata.insert("response_code".into(), serde_json::json!(code));
                data.metadata.insert("continuation".into(), serde_json::json!(continuation));
                continue;
            }

            let mut parts = line.splitn(2, ' ');
            let verb = parts.next().unwrap_or("").to_uppercase();
            let args = parts.next().unwrap_or("").trim();

            if !COMMAND_VERBS.contains(&verb.as_str()) {
                continue;
            }

            let state = self.sessions.with_session(&session_id, |s| {
                s.last_command = verb.clone();
                match verb.as_str() {
                    "CWD" => s.current_directory = args.to_string(),
                    "TYPE" => s.transfer_mode = args.to_string(),
                    "PORT" => s.data_connection = decode_port_command(args),
                    _ => {}
                }
            });

            match verb.as_str() {
                "USER" => {
                    data.headers.insert("Username".into(), args.to_string());
                }
                "PASS" => {
                    data.headers.insert("Password".into(), "***REDACTED***".into());
                }
                _ => {}
            }

            data.metadata.insert("command".into(), serde_json::json!(verb));
            data.metadata.insert("current_directory".into(), serde_json::json!(state.current_directory));
            if let Some(conn) = &state.data_connection {
                data.metadata.insert("data_connection".into(), serde_json::json!(conn));
            }
        }

        Ok(data)
    }
}
