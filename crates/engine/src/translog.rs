//! The transfer log: one line per completed or interrupted transfer,
//! written by whatever logging sink the host process configures via
//! `tracing` — this module only produces the line.
use std::time::Duration;

use tigerwire_core::tth::Tth;
use tigerwire_proto::escape::escape;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Download,
    Upload,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Completion {
    Complete,
    Incomplete,
}

pub struct TransferLogEntry<'a> {
    pub hub_name: &'a str,
    pub cid: Option<&'a str>,
    pub nick: &'a str,
    pub host: &'a str,
    pub direction: Direction,
    pub completion: Completion,
    pub tth: Tth,
    pub duration: Duration,
    pub size: u64,
    pub offset: u64,
    pub bytes_transferred: u64,
    pub virtual_path: &'a str,
}

impl std::fmt::Display for TransferLogEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cid = self.cid.unwrap_or("-");
        let dir = match self.direction {
            Direction::Download => 'd',
            Direction::Upload => 'u',
        };
        let complete = match self.completion {
            Completion::Complete => 'c',
            Completion::Incomplete => 'i',
        };
        write!(
            f,
            "{} {} {} {} {}{} {} {} {} {} {} {}",
            escape(self.hub_name),
            escape(cid),
            escape(self.nick),
            escape(self.host),
            dir,
            complete,
            self.tth,
            self.duration.as_secs(),
            self.size,
            self.offset,
            self.bytes_transferred,
            escape(self.virtual_path),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigerwire_core::cid::CID_LEN;
    use tigerwire_core::id::Id;

    #[test]
    fn formats_expected_field_order() {
        let tth: Tth = Id::new([1u8; CID_LEN]);
        let entry = TransferLogEntry {
            hub_name: "My Hub",
            cid: Some("cid1"),
            nick: "alice",
            host: "1.2.3.4:412",
            direction: Direction::Download,
            completion: Completion::Complete,
            tth,
            duration: Duration::from_secs(42),
            size: 1000,
            offset: 0,
            bytes_transferred: 1000,
            virtual_path: "/share/movie.mkv",
        };
        let line = entry.to_string();
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields[0], "My\\sHub");
        assert_eq!(fields[4], "dc");
        assert_eq!(fields.last().unwrap(), &"/share/movie.mkv");
    }
}
