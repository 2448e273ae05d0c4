use std::borrow::Cow;

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";
pub const STATUS_BROADCAST_JID: &str = "status@broadcast";

/// The reserved account the service uses for its own system messages.
pub const SYSTEM_JID: &str = "0@s.whatsapp.net";
pub const SYSTEM_NAME: &str = "WhatsApp";

/// Returns true if `jid` carries a `:<digits>@` device marker.
pub fn has_device_marker(jid: &str) -> bool {
    let bytes = jid.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            let digits_start = i + 1;
            let mut j = digits_start;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > digits_start && j < bytes.len() && bytes[j] == b'@' {
                return true;
            }
        }
        i += 1;
    }
    false
}

/// Splits a JID into its `user` and `server` parts, dropping any agent or
/// device component from the user part (`user_agent:device@server`).
pub fn split_jid(jid: &str) -> Option<(&str, &str)> {
    let (combined, server) = jid.split_once('@')?;
    let user_agent = combined.split(':').next().unwrap_or(combined);
    let user = user_agent.split('_').next().unwrap_or(user_agent);
    Some((user, server))
}

/// Canonicalizes a JID by stripping the per-device suffix.
///
/// Identifiers without a `:<digits>@` marker are returned unchanged, which
/// makes the function idempotent: `decode_jid(decode_jid(x)) == decode_jid(x)`.
pub fn decode_jid(jid: &str) -> Cow<'_, str> {
    if !has_device_marker(jid) {
        return Cow::Borrowed(jid);
    }
    match split_jid(jid) {
        Some((user, server)) if !user.is_empty() && !server.is_empty() => {
            Cow::Owned(format!("{user}@{server}"))
        }
        _ => Cow::Borrowed(jid),
    }
}

pub fn is_group(jid: &str) -> bool {
    jid.ends_with(&format!("@{GROUP_SERVER}"))
}

pub fn is_status_broadcast(jid: &str) -> bool {
    jid == STATUS_BROADCAST_JID
}

/// The part of a JID before the `@`, or the whole input if there is none.
pub fn user_part(jid: &str) -> &str {
    jid.split_once('@').map(|(user, _)| user).unwrap_or(jid)
}

/// Strips everything but ASCII digits.
pub fn digits_only(input: &str) -> String {
    input.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Formats the user part of a JID (or a bare number) in international form.
pub fn format_international(jid_or_number: &str) -> String {
    let user = user_part(jid_or_number);
    let user = user.split(':').next().unwrap_or(user);
    format!("+{}", digits_only(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_strips_device_suffix() {
        assert_eq!(
            decode_jid("15551234567:12@s.whatsapp.net"),
            "15551234567@s.whatsapp.net"
        );
        assert_eq!(
            decode_jid("15551234567_1:3@s.whatsapp.net"),
            "15551234567@s.whatsapp.net"
        );
    }

    #[test]
    fn test_decode_leaves_canonical_unchanged() {
        for jid in [
            "15551234567@s.whatsapp.net",
            "120363021033254949@g.us",
            "status@broadcast",
            "",
            "no-at-sign",
            "user:abc@s.whatsapp.net",
        ] {
            assert!(matches!(decode_jid(jid), Cow::Borrowed(_)), "{jid}");
            assert_eq!(decode_jid(jid), jid);
        }
    }

    #[test]
    fn test_decode_is_idempotent() {
        for jid in [
            "15551234567:12@s.whatsapp.net",
            "a:1@b:2@c",
            ":1@server",
            "user:1@",
            "123@lid",
        ] {
            let once = decode_jid(jid).into_owned();
            let twice = decode_jid(&once).into_owned();
            assert_eq!(once, twice, "{jid}");
        }
    }

    #[test]
    fn test_decode_without_user_returns_original() {
        assert_eq!(decode_jid(":1@server"), ":1@server");
    }

    #[test]
    fn test_device_marker_detection() {
        assert!(has_device_marker("1:2@s.whatsapp.net"));
        assert!(!has_device_marker("1:@s.whatsapp.net"));
        assert!(!has_device_marker("1:2"));
        assert!(!has_device_marker("1@s.whatsapp.net"));
    }

    #[test]
    fn test_format_international() {
        assert_eq!(
            format_international("15551234567@s.whatsapp.net"),
            "+15551234567"
        );
        assert_eq!(format_international("+1 (555) 123-4567"), "+15551234567");
        assert_eq!(format_international("15551234567:4@s.whatsapp.net"), "+15551234567");
    }

    #[test]
    fn test_group_and_status_detection() {
        assert!(is_group("120363021033254949@g.us"));
        assert!(!is_group("15551234567@s.whatsapp.net"));
        assert!(is_status_broadcast(STATUS_BROADCAST_JID));
        assert!(!is_status_broadcast("123@broadcast"));
    }
}
