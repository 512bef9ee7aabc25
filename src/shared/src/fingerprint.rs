//! Stable short identifiers for caller-supplied subscription/publish ids.
//!
//! Short ids pass through verbatim; long ones are replaced by a base36
//! rendering of a 32-bit hash. This is a deduplication key only; collisions
//! are tolerable, secrecy is not a goal.

/// Ids at or above this length are replaced by their hash rendering.
const VERBATIM_MAX: usize = 64;

/// Upper bound on the fingerprint length, relay-subscription-id friendly.
const FINGERPRINT_MAX: usize = 63;

/// Derive the fingerprint for a caller-supplied id.
pub fn fingerprint(id: &str) -> String {
    if id.len() < VERBATIM_MAX {
        return id.to_string();
    }
    let mut out = to_base36(fnv1a_32(id.as_bytes()));
    out.truncate(FINGERPRINT_MAX);
    out
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).expect("base36 digits are ascii")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_pass_through_verbatim() {
        assert_eq!(fingerprint("feed"), "feed");
        let just_under: String = "x".repeat(63);
        assert_eq!(fingerprint(&just_under), just_under);
    }

    #[test]
    fn long_ids_hash_deterministically() {
        let long: String = "r".repeat(200);
        let a = fingerprint(&long);
        let b = fingerprint(&long);
        assert_eq!(a, b);
        assert_ne!(a, long);
        assert!(a.len() <= 63);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn distinct_long_ids_usually_differ() {
        let a = fingerprint(&"a".repeat(100));
        let b = fingerprint(&"b".repeat(100));
        assert_ne!(a, b);
    }

    #[test]
    fn base36_renders_known_values() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }
}
