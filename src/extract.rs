//! Address extraction from message headers. Pure functions, no I/O; the
//! per-job running set owned by the sync controller is the dedup boundary.

use std::collections::HashSet;

use crate::mailbox::MessageHeader;

/// Normalize a raw header address into `local@domain` with a lower-cased
/// domain, or None when no usable address is present.
///
/// Accepts both bare addresses and `Display Name <user@host>` forms.
pub fn normalize_address(raw: &str) -> Option<String> {
    let s = raw.trim();
    let s = match (s.rfind('<'), s.rfind('>')) {
        (Some(open), Some(close)) if open < close => &s[open + 1..close],
        _ => s,
    };
    let s = s.trim().trim_matches('"').trim();
    let at = s.rfind('@')?;
    let local = &s[..at];
    let domain = &s[at + 1..];
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    if local.contains(char::is_whitespace) || domain.contains(char::is_whitespace) {
        return None;
    }
    if !domain.contains('.') && !domain.eq_ignore_ascii_case("localhost") {
        return None;
    }
    Some(format!("{}@{}", local, domain.to_ascii_lowercase()))
}

/// Extract the set of normalized addresses referenced by one message header
/// (from/to/cc/bcc).
pub fn extract_addresses(header: &MessageHeader) -> HashSet<String> {
    let mut out = HashSet::new();
    for raw in header
        .from
        .iter()
        .chain(&header.to)
        .chain(&header.cc)
        .chain(&header.bcc)
    {
        if let Some(addr) = normalize_address(raw) {
            out.insert(addr);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_address() {
        assert_eq!(
            normalize_address("user@example.com"),
            Some("user@example.com".into())
        );
    }

    #[test]
    fn display_name_stripped() {
        assert_eq!(
            normalize_address("Jane Doe <jane@Example.COM>"),
            Some("jane@example.com".into())
        );
        assert_eq!(
            normalize_address("\"Doe, Jane\" <jane@example.com>"),
            Some("jane@example.com".into())
        );
    }

    #[test]
    fn domain_lowercased_local_preserved() {
        assert_eq!(
            normalize_address("MixedCase@EXAMPLE.ORG"),
            Some("MixedCase@example.org".into())
        );
    }

    #[test]
    fn whitespace_trimmed() {
        assert_eq!(
            normalize_address("  user@example.com  "),
            Some("user@example.com".into())
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(normalize_address(""), None);
        assert_eq!(normalize_address("not an address"), None);
        assert_eq!(normalize_address("@example.com"), None);
        assert_eq!(normalize_address("user@"), None);
        assert_eq!(normalize_address("user@@"), None);
        assert_eq!(normalize_address("user @example.com"), None);
        assert_eq!(normalize_address("undisclosed-recipients:;"), None);
    }

    #[test]
    fn extraction_covers_all_recipient_fields() {
        let header = MessageHeader {
            from: vec!["a@x.com".into()],
            to: vec!["b@x.com".into(), "c@x.com".into()],
            cc: vec!["d@x.com".into()],
            bcc: vec!["e@x.com".into()],
        };
        let set = extract_addresses(&header);
        assert_eq!(set.len(), 5);
        assert!(set.contains("e@x.com"));
    }

    #[test]
    fn extraction_is_idempotent() {
        let header = MessageHeader {
            from: vec!["A <a@X.com>".into()],
            to: vec!["a@x.com".into(), "a@x.COM".into()],
            cc: vec![],
            bcc: vec![],
        };
        // local part is case-sensitive, so "A@" and "a@" would differ; here
        // all three collapse onto the same normalized form
        let first = extract_addresses(&header);
        let second = extract_addresses(&header);
        assert_eq!(first, second);
        assert_eq!(first.len(), 1);
        assert!(first.contains("a@x.com"));
    }
}
