//! SMTP state machine: Init -> Greeting -> Auth -> Ready -> Data -> Quit.
//! In the Data state, accumulates RFC-822 message content until a bare `.`
//! line, then extracts sender, recipients, subject, and auth method.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::PacketInfo;

use super::{ParseError, ParserInfo, ProtocolParser};

const SMTP_VERBS: &[&str] = &[
    "HELO", "EHLO", "MAIL", "RCPT", "DATA", "RSET", "VRFY", "EXPN", "HELP", "NOOP", "QUIT", "AUTH",
    "STARTTLS",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    Init,
    Greeting,
    Auth,
    Ready,
    Data,
    Quit,
}

pub fn is_smtp_line(payload: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(payload) else { return false };
    let line = text.lines().next().unwrap_or("");
    if line.len() >= 3 && line.as_bytes()[..3].iter().all(|b| b.is_ascii_digit()) {
        return true;
    }
    let verb = line.split_whitespace().next().unwrap_or("").to_uppercase();
    SMTP_VERBS.contains(&verb.as_str())
}

#[derive(Debug, Clone)]
struct SmtpSession {
    state: SmtpState,
    auth_method: Option<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    data_buffer: String,
    in_data: bool,
}

impl Default for SmtpSession {
    fn default() -> Self {
        Self {
            state: SmtpState::Init,
            auth_method: None,
            sender: None,
            recipients: Vec::new(),
            data_buffer: String::new(),
            in_data: false,
        }
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<String, SmtpSession>>,
}

fn extract_header<'a>(message: &'a str, name: &str) -> Option<&'a str> {
    message.lines().find_map(|line| line.strip_prefix(&format!("{name}:")).map(str::trim))
}

pub struct SmtpParser {
    sessions: SessionTable,
}

impl SmtpParser {
    pub fn new() -> Self {
        Self { sessions: SessionTable::default() }
    }
}

impl Default for SmtpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolParser for SmtpParser {
    fn info(&self) -> ParserInfo {
        ParserInfo { name: "smtp", version: "1.0", protocols: &["smtp"] }
    }

    fn can_parse(&self, packet: &PacketInfo) -> bool {
        (packet.dst_port == 25 || packet.dst_port == 587 || packet.src_port == 25)
            && (is_smtp_line(&packet.payload) || self.session_in_data(&packet.session_id()))
    }

    fn parse(&self, packet: &PacketInfo) -> Result<crate::model::ParsedData, ParseError> {
        let text = String::from_utf8_lossy(&packet.payload);
        let session_id = packet.session_id();
        let mut data = crate::model::ParsedData::new("smtp");
        let mut sessions = self.sessions.sessions.lock().unwrap();
        let session = sessions.entry(session_id).or_default();

        if session.in_data {
            for line in text.lines() {
                if line.trim_end_matches('\r') == "." {
                    session.in_data = false;
                    session.state = SmtpState::Ready;
                    let message = std::mem::take(&mut session.data_buffer);
                    data.metadata.insert("sender".into(), serde_json::json!(session.sender));
                    data.metadata.insert("recipients".into(), serde_json::json!(session.recipients));
                    if let Some(subject) = extract_header(&message, "Subject") {
                        data.metadata.insert("subject".into(), serde_json::json!(subject));
                    }
                    data.body = message.into_bytes();
                    return Ok(data);
                }
                session.data_buffer.push_str(line);
                session.data_buffer.push('\n');
            }
            data.metadata.insert("state".into(), serde_json::json!("data"));
            return Ok(data);
        }

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, ' ');
            let verb = parts.next().unwrap_or("").to_uppercase();
            let args = parts.next().unwrap_or("").trim();

            match verb.as_str() {
                "HELO" | "EHLO" => session.state = SmtpState::Greeting,
                "AUTH" => {
                    session.state = SmtpState::Auth;
                    session.auth_method = args.split_whitespace().next().map(str::to_string);
                }
                "MAIL" => {
                    session.state = SmtpState::Ready;
                    session.sender = args.strip_prefix("FROM:").map(|s| s.trim().to_string());
                }
                "RCPT" => {
                    if let Some(addr) = args.strip_prefix("TO:") {
                        session.recipients.push(addr.trim().to_string());
                    }
                }
                "DATA" => {
                    session.state = SmtpState::Data;
                    session.in_data = true;
                    session.data_buffer.clear();
                }
                "QUIT" => session.state = SmtpState::Quit,
                _ => {}
            }

            data.metadata.insert("command".into(), serde_json::json!(verb));
        }

        data.metadata.insert("state".into(), serde_json::json!(format!("{:?}", session.state)));
        if let Some(method) = &session.auth_method {
            data.metadata.insert("auth_method".into(), serde_json::json!(method));
        }

        Ok(data)
    }
}

impl SmtpParser {
    fn session_in_data(&self, session_id: &str) -> bool {
        self.sessions.sessions.lock().unwrap().get(session_id).map(|s| s.in_data).unwrap_or(false)
    }
}
