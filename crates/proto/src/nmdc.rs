//! NMDC client-to-client messages: pipe-terminated, hub-encoded. The framing
//! layer (in the engine crate) strips the trailing `|`; these functions work
//! on one already-delimited frame.
use crate::message::{FileId, GetRequest, SndHeader, TransferType};
use crate::ProtoError;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum NmdcMessage {
    MyNick { nick: String },
    Lock { lock: String, pk: String },
    Supports { flags: Vec<String> },
    Direction { download: bool, num: u16 },
    Key { key: String },
    AdcGet(GetRequest),
    AdcSnd(SndHeader),
    Error { msg: String },
    MaxedOut,
}

fn parse_transfer_fields(rest: &str) -> Option<(TransferType, FileId, &str)> {
    let mut it = rest.splitn(3, ' ');
    let typ = TransferType::parse(it.next()?)?;
    let id = FileId::parse(it.next()?)?;
    let tail = it.next()?;
    Some((typ, id, tail))
}

pub fn parse(frame: &str) -> Result<NmdcMessage, ProtoError> {
    let frame = frame.trim_end_matches('|');
    if let Some(rest) = frame.strip_prefix("$MyNick ") {
        return Ok(NmdcMessage::MyNick {
            nick: rest.to_string(),
        });
    }
    if let Some(rest) = frame.strip_prefix("$Lock ") {
        let mut it = rest.splitn(2, " Pk=");
        let lock = it.next().unwrap_or_default().to_string();
        let pk = it.next().unwrap_or_default().to_string();
        return Ok(NmdcMessage::Lock { lock, pk });
    }
    if let Some(rest) = frame.strip_prefix("$Supports ") {
        return Ok(NmdcMessage::Supports {
            flags: rest.split(' ').map(str::to_string).collect(),
        });
    }
    if let Some(rest) = frame.strip_prefix("$Direction ") {
        let mut it = rest.splitn(2, ' ');
        let dir = it.next().ok_or(ProtoError::Malformed)?;
        let num: u16 = it
            .next()
            .ok_or(ProtoError::Malformed)?
            .parse()
            .map_err(|_| ProtoError::Malformed)?;
        let download = match dir {
            "Download" => true,
            "Upload" => false,
            _ => return Err(ProtoError::Malformed),
        };
        return Ok(NmdcMessage::Direction { download, num });
    }
    if let Some(rest) = frame.strip_prefix("$Key ") {
        return Ok(NmdcMessage::Key {
            key: rest.to_string(),
        });
    }
    if let Some(rest) = frame.strip_prefix("$ADCGET ") {
        let (typ, id, tail) = parse_transfer_fields(rest).ok_or(ProtoError::Malformed)?;
        let mut it = tail.splitn(2, ' ');
        let start: u64 = it
            .next()
            .ok_or(ProtoError::Malformed)?
            .parse()
            .map_err(|_| ProtoError::Malformed)?;
        let bytes: i64 = it
            .next()
            .ok_or(ProtoError::Malformed)?
            .parse()
            .map_err(|_| ProtoError::Malformed)?;
        return Ok(NmdcMessage::AdcGet(GetRequest {
            typ,
            id,
            start,
            bytes,
        }));
    }
    if let Some(rest) = frame.strip_prefix("$ADCSND ") {
        let (typ, id, tail) = parse_transfer_fields(rest).ok_or(ProtoError::Malformed)?;
        let mut it = tail.splitn(2, ' ');
        let start: u64 = it
            .next()
            .ok_or(ProtoError::Malformed)?
            .parse()
            .map_err(|_| ProtoError::Malformed)?;
        let bytes: u64 = it
            .next()
            .ok_or(ProtoError::Malformed)?
            .parse()
            .map_err(|_| ProtoError::Malformed)?;
        return Ok(NmdcMessage::AdcSnd(SndHeader {
            typ,
            id,
            start,
            bytes,
        }));
    }
    if let Some(rest) = frame.strip_prefix("$Error ") {
        return Ok(NmdcMessage::Error {
            msg: rest.to_string(),
        });
    }
    if frame == "$MaxedOut" {
        return Ok(NmdcMessage::MaxedOut);
    }
    Err(ProtoError::UnknownCommand)
}

pub fn encode(msg: &NmdcMessage) -> String {
    let body = match msg {
        NmdcMessage::MyNick { nick } => format!("$MyNick {nick}"),
        NmdcMessage::Lock { lock, pk } => format!("$Lock {lock} Pk={pk}"),
        NmdcMessage::Supports { flags } => format!("$Supports {}", flags.join(" ")),
        NmdcMessage::Direction { download, num } => {
            let dir = if *download { "Download" } else { "Upload" };
            format!("$Direction {dir} {num}")
        }
        NmdcMessage::Key { key } => format!("$Key {key}"),
        NmdcMessage::AdcGet(g) => format!(
            "$ADCGET {} {} {} {}",
            g.typ.as_str(),
            g.id.encode(),
            g.start,
            g.bytes
        ),
        NmdcMessage::AdcSnd(s) => format!(
            "$ADCSND {} {} {} {}",
            s.typ.as_str(),
            s.id.encode(),
            s.start,
            s.bytes
        ),
        NmdcMessage::Error { msg } => format!("$Error {msg}"),
        NmdcMessage::MaxedOut => "$MaxedOut".to_string(),
    };
    format!("{body}|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_adcget() {
        let msg = NmdcMessage::AdcGet(GetRequest {
            typ: TransferType::File,
            id: FileId::Path("/share/movie.mkv".into()),
            start: 0,
            bytes: -1,
        });
        let wire = encode(&msg);
        assert_eq!(wire, "$ADCGET file /share/movie.mkv 0 -1|");
        assert_eq!(parse(&wire).unwrap(), msg);
    }

    #[test]
    fn parses_direction() {
        let msg = parse("$Direction Download 12345|").unwrap();
        assert_eq!(
            msg,
            NmdcMessage::Direction {
                download: true,
                num: 12345
            }
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(matches!(
            parse("$Bogus foo|"),
            Err(ProtoError::UnknownCommand)
        ));
    }
}
