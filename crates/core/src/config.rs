//! The typed configuration snapshot read once per connection/transfer and
//! handed down by `Arc` reference rather than read from a global.

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TlsPolicy {
    Disabled,
    Allowed,
    Preferred,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub slots: u32,
    pub minislots: u32,
    pub minislot_size: u64,
    /// Minimum segment size in bytes; `0` means "whole remaining thread".
    pub download_segment: u64,
    pub upload_rate: Option<u64>,
    pub download_rate: Option<u64>,
    pub hash_rate: Option<u64>,
    pub tls_policy: TlsPolicy,
    pub disconnect_offline: bool,
    pub log_downloads: bool,
    pub log_uploads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slots: 3,
            minislots: 3,
            minislot_size: 64 * 1024,
            download_segment: 0,
            upload_rate: None,
            download_rate: None,
            hash_rate: None,
            tls_policy: TlsPolicy::Allowed,
            disconnect_offline: true,
            log_downloads: true,
            log_uploads: true,
        }
    }
}
