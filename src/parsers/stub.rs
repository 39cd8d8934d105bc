//! Minimal stub parser for protocols the engine detects but does not deeply
//! parse: POP3, IMAP, SMB/CIFS, PostgreSQL, SQL Server, MQTT, AMQP, Kafka,
//! gRPC, GraphQL, WebSocket, SFTP. Marks the content-type and preserves the
//! raw payload without attempting protocol-specific extraction.

use crate::model::PacketInfo;

use super::{ParseError, ParserInfo, ProtocolParser};

const MAX_PRESERVED_BYTES: usize = 4096;

pub struct StubParser {
    name: &'static str,
    protocols: &'static [&'static str],
}

impl StubParser {
    pub fn new(name: &'static str, protocols: &'static [&'static str]) -> Self {
        Self { name, protocols }
    }
}

impl ProtocolParser for StubParser {
    fn info(&self) -> ParserInfo {
        ParserInfo { name: self.name, version: "1.0", protocols: self.protocols }
    }

    fn can_parse(&self, packet: &PacketInfo) -> bool {
        self.protocols.iter().any(|tag| super::ProtocolDetector::detect(&packet.payload, packet.dst_port) == *tag)
    }

    fn parse(&self, packet: &PacketInfo) -> Result<crate::model::ParsedData, ParseError> {
        let mut data = crate::model::ParsedData::new(self.name);
        data.content_type = Some(self.name.to_string());
        let end = packet.payload.len().min(MAX_PRESERVED_BYTES);
        data.body = packet.payload[..end].to_vec();
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, L4Protocol, ReinjectHandle};
    use std::net::Ipv4Addr;

    #[test]
    fn test_stub_parser_preserves_payload_and_marks_protocol() {
        let parser = StubParser::new("mqtt", &["mqtt"]);
        let pkt = PacketInfo::new(
            1,
            Direction::Outbound,
            L4Protocol::Tcp,
            Ipv4Addr::new(10, 0, 0, 1),
            5000,
            Ipv4Addr::new(1, 2, 3, 4),
            1883,
            b"\x10\x0c\x00\x04MQTT".to_vec(),
            ReinjectHandle::None,
        );
        let data = parser.parse(&pkt).unwrap();
        assert_eq!(data.protocol, "mqtt");
        assert_eq!(data.content_type.as_deref(), Some("mqtt"));
        assert_eq!(data.body, pkt.payload);
    }
}
