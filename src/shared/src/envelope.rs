//! Byte framings used on the status and signer rings.
//!
//! Relay state transitions travel as `status|url` text lines; raw frames that
//! must keep their source URL travel as the binary envelope
//! `[urlLen:u16 BE][url][rawLen:u32 BE][raw]`.

/// Statuses emitted on relay state transitions.
pub const STATUS_CONNECTING: &str = "connecting";
pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CLOSE: &str = "close";

/// Format a `status|url` line. The frontend splits on the first '|'.
pub fn format_status_line(status: &str, url: &str) -> String {
    let mut line = String::with_capacity(status.len() + 1 + url.len());
    line.push_str(status);
    line.push('|');
    line.push_str(url);
    line
}

/// Split a `status|url` line.
pub fn parse_status_line(line: &str) -> Option<(&str, &str)> {
    line.split_once('|')
}

/// Pack a (url, raw) pair into the binary envelope.
pub fn pack_envelope(url: &str, raw: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + url.len() + 4 + raw.len());
    out.extend_from_slice(&(url.len() as u16).to_be_bytes());
    out.extend_from_slice(url.as_bytes());
    out.extend_from_slice(&(raw.len() as u32).to_be_bytes());
    out.extend_from_slice(raw.as_bytes());
    out
}

/// Unpack the binary envelope. Returns None on any length inconsistency.
pub fn unpack_envelope(bytes: &[u8]) -> Option<(String, String)> {
    if bytes.len() < 2 {
        return None;
    }
    let url_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let raw_len_at = 2 + url_len;
    if bytes.len() < raw_len_at + 4 {
        return None;
    }
    let url = std::str::from_utf8(&bytes[2..raw_len_at]).ok()?;
    let raw_len = u32::from_be_bytes(bytes[raw_len_at..raw_len_at + 4].try_into().unwrap()) as usize;
    let raw_start = raw_len_at + 4;
    if bytes.len() != raw_start + raw_len {
        return None;
    }
    let raw = std::str::from_utf8(&bytes[raw_start..]).ok()?;
    Some((url.to_string(), raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_pack_unpack_is_a_bijection() {
        let url = "wss://relay.damus.io";
        let raw = r#"["EVENT","sub1",{"kind":1,"content":"héllo"}]"#;
        let packed = pack_envelope(url, raw);
        let (u, r) = unpack_envelope(&packed).unwrap();
        assert_eq!(u, url);
        assert_eq!(r, raw);
        assert_eq!(pack_envelope(&u, &r), packed);
    }

    #[test]
    fn truncated_envelopes_are_rejected() {
        let packed = pack_envelope("wss://r", "body");
        for cut in 0..packed.len() {
            assert!(unpack_envelope(&packed[..cut]).is_none(), "cut at {}", cut);
        }
        let mut extended = packed;
        extended.push(0);
        assert!(unpack_envelope(&extended).is_none());
    }

    #[test]
    fn status_lines_split_on_first_pipe() {
        let line = format_status_line(STATUS_CONNECTED, "wss://relay.example/path|x");
        let (status, url) = parse_status_line(&line).unwrap();
        assert_eq!(status, STATUS_CONNECTED);
        assert_eq!(url, "wss://relay.example/path|x");
    }
}
