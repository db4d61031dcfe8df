//! ADC client-to-client messages: newline-terminated, UTF-8, ADC-escaped.
//! The framing layer strips the trailing `\n`; these functions work on one
//! already-delimited line. Named parameters are two-letter-prefixed tokens
//! glued directly to their value (e.g. `ID<cid>`, `TO<token>`) rather than
//! separated by a space.
use tigerwire_core::Cid;

use crate::escape::{escape, split_tokens};
use crate::message::{FileId, GetRequest, SndHeader, TransferType};
use crate::ProtoError;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum AdcMessage {
    Sup { features: Vec<String> },
    Inf { id: Cid, token: Option<String> },
    Get(GetRequest),
    Snd(SndHeader),
    Sta { code: u16, msg: String },
}

fn find_param<'a>(tokens: &'a [String], prefix: &str) -> Option<&'a str> {
    tokens
        .iter()
        .find_map(|t| t.strip_prefix(prefix))
}

pub fn parse(line: &str) -> Result<AdcMessage, ProtoError> {
    let tokens = split_tokens(line);
    let cmd = tokens.first().ok_or(ProtoError::Malformed)?.as_str();
    match cmd {
        "CSUP" => Ok(AdcMessage::Sup {
            features: tokens[1..].to_vec(),
        }),
        "CINF" => {
            let id_str = find_param(&tokens, "ID").ok_or(ProtoError::Malformed)?;
            let id: Cid = id_str.parse().map_err(|_| ProtoError::Malformed)?;
            let token = find_param(&tokens, "TO").map(str::to_string);
            Ok(AdcMessage::Inf { id, token })
        }
        "CGET" => {
            if tokens.len() < 5 {
                return Err(ProtoError::Malformed);
            }
            let typ = TransferType::parse(&tokens[1]).ok_or(ProtoError::Malformed)?;
            let id = FileId::parse(&tokens[2]).ok_or(ProtoError::Malformed)?;
            let start: u64 = tokens[3].parse().map_err(|_| ProtoError::Malformed)?;
            let bytes: i64 = tokens[4].parse().map_err(|_| ProtoError::Malformed)?;
            Ok(AdcMessage::Get(GetRequest {
                typ,
                id,
                start,
                bytes,
            }))
        }
        "CSND" => {
            if tokens.len() < 5 {
                return Err(ProtoError::Malformed);
            }
            let typ = TransferType::parse(&tokens[1]).ok_or(ProtoError::Malformed)?;
            let id = FileId::parse(&tokens[2]).ok_or(ProtoError::Malformed)?;
            let start: u64 = tokens[3].parse().map_err(|_| ProtoError::Malformed)?;
            let bytes: u64 = tokens[4].parse().map_err(|_| ProtoError::Malformed)?;
            Ok(AdcMessage::Snd(SndHeader {
                typ,
                id,
                start,
                bytes,
            }))
        }
        "CSTA" => {
            if tokens.len() < 2 {
                return Err(ProtoError::Malformed);
            }
            let code: u16 = tokens[1].parse().map_err(|_| ProtoError::Malformed)?;
            let msg = tokens[2..].join(" ");
            Ok(AdcMessage::Sta { code, msg })
        }
        _ => Err(ProtoError::UnknownCommand),
    }
}

pub fn encode(msg: &AdcMessage) -> String {
    let body = match msg {
        AdcMessage::Sup { features } => format!("CSUP {}", features.join(" ")),
        AdcMessage::Inf { id, token } => {
            let mut s = format!("CINF ID{id}");
            if let Some(t) = token {
                s.push_str(&format!(" TO{}", escape(t)));
            }
            s
        }
        AdcMessage::Get(g) => format!(
            "CGET {} {} {} {}",
            g.typ.as_str(),
            g.id.encode(),
            g.start,
            g.bytes
        ),
        AdcMessage::Snd(s) => format!(
            "CSND {} {} {} {}",
            s.typ.as_str(),
            s.id.encode(),
            s.start,
            s.bytes
        ),
        AdcMessage::Sta { code, msg } => format!("CSTA {code:03} {}", escape(msg)),
    };
    format!("{body}\n")
}

/// ADC status-code subcodes used by the upload side.
pub mod status {
    pub const THROTTLED: u16 = 150;
    pub const NO_FILE: u16 = 151;
    pub const NO_PART: u16 = 152;
    pub const SLOTS_FULL: u16 = 153;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_cget() {
        let msg = AdcMessage::Get(GetRequest {
            typ: TransferType::File,
            id: FileId::FileList,
            start: 0,
            bytes: -1,
        });
        let wire = encode(&msg);
        assert_eq!(wire, "CGET file files.xml.bz2 0 -1\n");
        assert_eq!(parse(wire.trim_end()).unwrap(), msg);
    }

    #[test]
    fn parses_cinf_with_token() {
        let cid: Cid = Cid::new([9u8; 24]);
        let msg = AdcMessage::Inf {
            id: cid,
            token: Some("tok1".to_string()),
        };
        let wire = encode(&msg);
        let parsed = parse(wire.trim_end()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn parses_csta_slots_full() {
        let msg = parse("CSTA 153 No\\sSlots\\sAvailable").unwrap();
        assert_eq!(
            msg,
            AdcMessage::Sta {
                code: status::SLOTS_FULL,
                msg: "No Slots Available".to_string()
            }
        );
    }
}
