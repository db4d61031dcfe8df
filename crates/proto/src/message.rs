//! The dialect-polymorphic message type: a tagged variant over the NMDC
//! and ADC encodings. The CC state machine matches on `Message` and never
//! branches on dialect itself; only `nmdc`/`adc` parsing and encoding
//! differ.
use tigerwire_core::Tth;

use crate::adc::AdcMessage;
use crate::nmdc::NmdcMessage;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferType {
    File,
    Tthl,
    List,
}

impl TransferType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferType::File => "file",
            TransferType::Tthl => "tthl",
            TransferType::List => "list",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(TransferType::File),
            "tthl" => Some(TransferType::Tthl),
            "list" => Some(TransferType::List),
            _ => None,
        }
    }
}

/// The `<id>` part of a GET/SND: either the compressed file list, a
/// `/`-rooted share path, or a TTH-addressed file.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum FileId {
    FileList,
    Path(String),
    Tth(Tth),
}

impl FileId {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "files.xml.bz2" {
            Some(FileId::FileList)
        } else if let Some(rest) = s.strip_prefix("TTH/") {
            rest.parse().ok().map(FileId::Tth)
        } else if s.starts_with('/') {
            Some(FileId::Path(s.to_string()))
        } else {
            None
        }
    }

    pub fn encode(&self) -> String {
        match self {
            FileId::FileList => "files.xml.bz2".to_string(),
            FileId::Path(p) => p.clone(),
            FileId::Tth(tth) => format!("TTH/{tth}"),
        }
    }
}

/// A single GET request: transfer type, addressed id, start offset and
/// requested byte count (`-1` for "to end of file").
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GetRequest {
    pub typ: TransferType,
    pub id: FileId,
    pub start: u64,
    pub bytes: i64,
}

/// A granted SND header: transfer type, addressed id, start offset and
/// the exact byte count that will follow.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SndHeader {
    pub typ: TransferType,
    pub id: FileId,
    pub start: u64,
    pub bytes: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Message {
    Nmdc(NmdcMessage),
    Adc(AdcMessage),
}

impl Message {
    pub fn as_get(&self) -> Option<GetRequest> {
        match self {
            Message::Nmdc(NmdcMessage::AdcGet(g)) => Some(g.clone()),
            Message::Adc(AdcMessage::Get(g)) => Some(g.clone()),
            _ => None,
        }
    }

    pub fn as_snd(&self) -> Option<SndHeader> {
        match self {
            Message::Nmdc(NmdcMessage::AdcSnd(s)) => Some(s.clone()),
            Message::Adc(AdcMessage::Snd(s)) => Some(s.clone()),
            _ => None,
        }
    }
}
