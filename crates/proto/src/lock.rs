//! NMDC `$Lock`/`$Key` handshake cipher. This is the well-known
//! lock-to-key transform used by the NMDC client-to-client handshake:
//! each side presents a `$Lock`, and the
//! other computes `$Key` from it before the session is treated as
//! authenticated enough to proceed to `$Supports`/`$Direction`.
//!
//! The transform has no relation to TLS or to the hub wire protocol (which
//! is out of scope here); it is pure byte manipulation over the lock
//! string, so it lives in this sans-I/O crate like the rest of the message
//! codec.

/// Bytes whose XOR result cannot appear literally in an NMDC token (they
/// collide with protocol delimiters) and must be `/%DCN000%/`-escaped.
const ESCAPED: [u8; 5] = [0, 5, 36, 96, 124];

fn nmdc_escape_bytes(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if ESCAPED.contains(&b) || b == b'|' {
            out.push_str(&format!("/%DCN{:03}%/", b));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Derive the `$Key` value answering a peer's `$Lock <lock>`.
pub fn lock_to_key(lock: &str) -> String {
    let lock = lock.as_bytes();
    if lock.is_empty() {
        return String::new();
    }
    let n = lock.len();
    let mut key = vec![0u8; n];
    key[0] = lock[0] ^ lock[n - 1] ^ lock[n.saturating_sub(2)] ^ 5;
    for i in 1..n {
        key[i] = lock[i] ^ lock[i - 1];
    }
    for k in key.iter_mut() {
        *k = ((*k << 4) | (*k >> 4)) & 0xFF;
    }
    nmdc_escape_bytes(&key)
}

/// Generate a lock this side presents. The `Pk=` suffix names the client;
/// the lock body just needs to look plausible (DC++-compatible clients
/// accept any lock of sufficient length starting with `EXTENDEDPROTOCOL`
/// to also announce extension support).
pub fn generate_lock() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let suffix: String = (0..20)
        .map(|_| (rng.random_range(33u8..126u8)) as char)
        .collect();
    format!("EXTENDEDPROTOCOL{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_for_same_lock() {
        let lock = "EXTENDEDPROTOCOLABCDEFGH";
        assert_eq!(lock_to_key(lock), lock_to_key(lock));
    }

    #[test]
    fn different_locks_produce_different_keys() {
        assert_ne!(
            lock_to_key("EXTENDEDPROTOCOLAAAAAAAA"),
            lock_to_key("EXTENDEDPROTOCOLBBBBBBBB")
        );
    }

    #[test]
    fn escapes_reserved_bytes() {
        // A lock engineered so the first computed byte is 0 ends up escaped.
        let key = lock_to_key("\x05AAAA");
        assert!(key.contains("/%DCN"));
    }
}
