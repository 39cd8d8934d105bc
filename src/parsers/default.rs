//! Fallback parser used when no registered parser claims a packet, or when
//! a claimed parser's `parse` fails. Infers the protocol tag from the
//! destination port alone and preserves the raw payload.

use crate::model::PacketInfo;

use super::{port_hint, ParseError, ParserInfo, ProtocolParser};

pub struct DefaultParser;

impl ProtocolParser for DefaultParser {
    fn info(&self) -> ParserInfo {
        ParserInfo { name: "default", version: "1.0", protocols: &["unknown"] }
    }

    fn can_parse(&self, _packet: &PacketInfo) -> bool {
        true
    }

    fn parse(&self, packet: &PacketInfo) -> Result<crate::model::ParsedData, ParseError> {
        let mut data = crate::model::ParsedData::new(port_hint(packet.dst_port));
        data.body = packet.payload.clone();
        Ok(data)
    }
}
