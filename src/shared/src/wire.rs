//! Character-level scanning of relay wire frames.
//!
//! The routing layers only need the first elements of the JSON array a frame
//! carries: the kind token and, for most kinds, the subscription id. A full
//! JSON parse per frame is avoided; the scanner walks strings, nested objects
//! and primitives just far enough to slice out the leading elements.

/// Kind of an outbound client frame, for active-request accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrameKind {
    Req,
    Close,
    Other,
}

/// Classify an outbound frame by its first array element.
pub fn client_frame_kind(frame: &str) -> ClientFrameKind {
    let bytes = frame.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'[' {
        return ClientFrameKind::Other;
    }
    i += 1;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() || bytes[i] != b'"' {
        return ClientFrameKind::Other;
    }
    i += 1;
    let start = i;
    while i < bytes.len() && bytes[i] != b'"' {
        i += 1;
    }
    match &frame[start..i] {
        "REQ" => ClientFrameKind::Req,
        "CLOSE" => ClientFrameKind::Close,
        _ => ClientFrameKind::Other,
    }
}

/// Slice out the first three elements of a JSON array without parsing it.
/// String elements keep their enclosing quotes; objects and primitives are
/// returned as raw slices.
pub fn extract_first_three(text: &str) -> Option<[Option<&str>; 3]> {
    let bytes = text.as_bytes();
    if bytes.first()? != &b'[' {
        return None;
    }
    let mut idx = 1;
    let mut results: [Option<&str>; 3] = [None, None, None];
    let mut found = 0;

    while found < 3 && idx < bytes.len() {
        while idx < bytes.len()
            && (bytes[idx] == b' '
                || bytes[idx] == b'\n'
                || bytes[idx] == b'\r'
                || bytes[idx] == b',')
        {
            idx += 1;
        }
        if idx >= bytes.len() || bytes[idx] == b']' {
            break;
        }

        let start = idx;
        if bytes[idx] == b'"' {
            idx += 1;
            while idx < bytes.len() {
                match bytes[idx] {
                    b'\\' => idx += 2,
                    b'"' => {
                        results[found] = Some(&text[start..=idx]);
                        idx += 1;
                        break;
                    }
                    _ => idx += 1,
                }
            }
        } else if bytes[idx] == b'{' {
            let mut brace_count = 1;
            idx += 1;
            while idx < bytes.len() && brace_count > 0 {
                match bytes[idx] {
                    b'{' => brace_count += 1,
                    b'}' => brace_count -= 1,
                    b'"' => {
                        idx += 1;
                        while idx < bytes.len() {
                            if bytes[idx] == b'\\' {
                                idx += 2;
                                continue;
                            }
                            if bytes[idx] == b'"' {
                                break;
                            }
                            idx += 1;
                        }
                    }
                    _ => {}
                }
                idx += 1;
            }
            results[found] = Some(&text[start..idx]);
        } else {
            while idx < bytes.len() && bytes[idx] != b',' && bytes[idx] != b']' {
                idx += 1;
            }
            results[found] = Some(text[start..idx].trim());
        }
        found += 1;
    }

    Some(results)
}

/// Kind of an inbound relay frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingKind {
    Event,
    Eose,
    Ok,
    Closed,
    Notice,
    Auth,
}

impl IncomingKind {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "EVENT" => Some(Self::Event),
            "EOSE" => Some(Self::Eose),
            "OK" => Some(Self::Ok),
            "CLOSED" => Some(Self::Closed),
            "NOTICE" => Some(Self::Notice),
            "AUTH" => Some(Self::Auth),
            _ => None,
        }
    }

    /// Whether the second array element names a subscription (or event) id.
    pub fn carries_sub_id(&self) -> bool {
        !matches!(self, Self::Notice | Self::Auth)
    }
}

/// A classified inbound frame: kind, id when the kind carries one, and the
/// third element as a raw slice.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a> {
    pub kind: IncomingKind,
    pub sub_id: Option<&'a str>,
    pub payload: Option<&'a str>,
}

/// Classify an inbound frame. Returns None for anything that is not a known
/// relay message; handlers must stay non-blocking.
pub fn classify_incoming(text: &str) -> Option<Incoming<'_>> {
    let parts = extract_first_three(text)?;
    let kind = IncomingKind::from_token(parts[0]?.trim_matches('"'))?;
    let sub_id = if kind.carries_sub_id() {
        parts[1].map(|s| s.trim_matches('"'))
    } else {
        None
    };
    Some(Incoming {
        kind,
        sub_id,
        payload: parts[2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_kinds() {
        assert_eq!(
            client_frame_kind(r#"["REQ","s1",{"kinds":[1]}]"#),
            ClientFrameKind::Req
        );
        assert_eq!(client_frame_kind(r#"  [ "CLOSE", "s1" ]"#), ClientFrameKind::Close);
        assert_eq!(
            client_frame_kind(r#"["EVENT",{"kind":1}]"#),
            ClientFrameKind::Other
        );
        assert_eq!(client_frame_kind("not json"), ClientFrameKind::Other);
    }

    #[test]
    fn extracts_strings_objects_and_primitives() {
        let frame = r#"["EVENT","sub-1",{"id":"ab","content":"a \"quoted\" ] brace"}]"#;
        let parts = extract_first_three(frame).unwrap();
        assert_eq!(parts[0], Some(r#""EVENT""#));
        assert_eq!(parts[1], Some(r#""sub-1""#));
        assert_eq!(
            parts[2],
            Some(r#"{"id":"ab","content":"a \"quoted\" ] brace"}"#)
        );

        let ok = r#"["OK","ev",true,""]"#;
        let parts = extract_first_three(ok).unwrap();
        assert_eq!(parts[2], Some("true"));
    }

    #[test]
    fn classifies_inbound_kinds_with_ids() {
        let inc = classify_incoming(r#"["EOSE","feed"]"#).unwrap();
        assert_eq!(inc.kind, IncomingKind::Eose);
        assert_eq!(inc.sub_id, Some("feed"));

        let inc = classify_incoming(r#"["NOTICE","slow down"]"#).unwrap();
        assert_eq!(inc.kind, IncomingKind::Notice);
        assert_eq!(inc.sub_id, None);

        assert!(classify_incoming(r#"["BOGUS","x"]"#).is_none());
        assert!(classify_incoming("{}").is_none());
    }
}
