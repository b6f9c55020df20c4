//! Correlation IDs for messages and tool calls

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// New `msg-` identifier
pub fn message_id() -> String {
    generate("msg")
}

/// New `tool-` identifier
pub fn tool_call_id() -> String {
    generate("tool")
}

fn generate(prefix: &str) -> String {
    let mut bytes = [0u8; 8];
    let random = match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => Some(bytes),
        Err(e) => {
            debug!("Random source unavailable, using timestamp id: {}", e);
            None
        }
    };
    format_id(prefix, random)
}

/// 16 hex chars from the random bytes, else the current time in nanoseconds
fn format_id(prefix: &str, random: Option<[u8; 8]>) -> String {
    match random {
        Some(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            format!("{}-{}", prefix, hex)
        }
        None => {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            format!("{}-{}", prefix, nanos)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids() {
        let a = message_id();
        let b = message_id();

        assert_ne!(a, b);
        assert!(a.starts_with("msg-"));
        assert_eq!(a.len(), "msg-".len() + 16);
        assert!(a[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(tool_call_id().starts_with("tool-"));
    }

    #[test]
    fn test_fixed_bytes() {
        let id = format_id("msg", Some([0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]));
        assert_eq!(id, "msg-deadbeef00010203");
    }

    #[test]
    fn test_timestamp_fallback() {
        let id = format_id("msg", None);
        let digits = id.strip_prefix("msg-").unwrap();

        assert!(!digits.is_empty());
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
    }
}
