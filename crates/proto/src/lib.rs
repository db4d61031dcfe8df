//! NMDC and ADC client-to-client wire message parsing and encoding.
//!
//! This crate is sans-I/O: it turns an already-delimited frame (one `|`
//! terminated NMDC command, or one `\n` terminated ADC line, with the
//! terminator stripped) into a [`Message`], and back. Reading frames off a
//! socket and picking the delimiter per dialect is the engine's job.

pub mod adc;
pub mod dialect;
pub mod escape;
pub mod lock;
pub mod message;
pub mod nmdc;

pub use adc::AdcMessage;
pub use dialect::Dialect;
pub use message::{FileId, GetRequest, Message, SndHeader, TransferType};
pub use nmdc::NmdcMessage;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("malformed message")]
    Malformed,
    #[error("unknown command")]
    UnknownCommand,
    #[error("frame exceeded the maximum allowed size")]
    FrameTooLarge,
}

impl Message {
    pub fn parse_nmdc(frame: &str) -> Result<Self, ProtoError> {
        nmdc::parse(frame).map(Message::Nmdc)
    }

    pub fn parse_adc(frame: &str) -> Result<Self, ProtoError> {
        adc::parse(frame).map(Message::Adc)
    }

    pub fn encode(&self) -> String {
        match self {
            Message::Nmdc(m) => nmdc::encode(m),
            Message::Adc(m) => adc::encode(m),
        }
    }
}
