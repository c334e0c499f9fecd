//! Identity helpers: pure functions mapping raw protocol identifiers to
//! canonical contact keys.
//!
//! A JID looks like `user[:device]@server`. Canonical keys drop the device
//! suffix so every linked device of one account maps to the same contact.

use crate::error::GatewayError;

/// Server for phone-number identities.
pub const USER_SERVER: &str = "s.whatsapp.net";
/// Server for group conversations.
pub const GROUP_SERVER: &str = "g.us";
/// Server for alias (LID) identities.
pub const LID_SERVER: &str = "lid";
/// The status/stories pseudo-conversation.
pub const STATUS_BROADCAST: &str = "status@broadcast";
/// Platform system account.
pub const SYSTEM_ACCOUNT: &str = "0@s.whatsapp.net";

/// What kind of entity a JID addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JidKind {
    User,
    Group,
    Lid,
    Broadcast,
    Newsletter,
    Unknown,
}

/// Canonicalize a raw JID: trim, lowercase, drop the device suffix and map
/// the legacy `c.us` server to `s.whatsapp.net`.
pub fn normalize(raw: &str) -> String {
    let raw = raw.trim().to_ascii_lowercase();
    let Some((user, server)) = raw.split_once('@') else {
        return raw;
    };
    let user = user.split(':').next().unwrap_or(user);
    let server = if server == "c.us" { USER_SERVER } else { server };
    format!("{user}@{server}")
}

/// Classify a (normalized or raw) JID.
pub fn kind(jid: &str) -> JidKind {
    match jid.rsplit_once('@').map(|(_, server)| server) {
        Some(USER_SERVER) | Some("c.us") => JidKind::User,
        Some(GROUP_SERVER) => JidKind::Group,
        Some(LID_SERVER) => JidKind::Lid,
        Some("broadcast") => JidKind::Broadcast,
        Some("newsletter") => JidKind::Newsletter,
        _ => JidKind::Unknown,
    }
}

pub fn is_group(jid: &str) -> bool {
    kind(jid) == JidKind::Group
}

pub fn is_lid(jid: &str) -> bool {
    kind(jid) == JidKind::Lid
}

/// True for conversations that are never stored: status broadcast, other
/// broadcast lists, and the platform system account.
pub fn is_ignored_conversation(jid: &str) -> bool {
    let jid = normalize(jid);
    jid == STATUS_BROADCAST || kind(&jid) == JidKind::Broadcast || jid == SYSTEM_ACCOUNT
}

/// The part before `@`, without device suffix.
pub fn user_part(jid: &str) -> &str {
    let user = jid.split('@').next().unwrap_or(jid);
    user.split(':').next().unwrap_or(user)
}

/// Phone number (digits only) of a phone-number JID. `None` for groups and aliases.
pub fn phone_of(jid: &str) -> Option<String> {
    if kind(jid) != JidKind::User {
        return None;
    }
    let digits: String = user_part(jid).chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Turn an outbound destination (bare phone, formatted phone, or full JID)
/// into a canonical JID.
pub fn destination_jid(destination: &str) -> Result<String, GatewayError> {
    let trimmed = destination.trim();
    if trimmed.contains('@') {
        return Ok(normalize(trimmed));
    }
    // Legacy group ids: `<creator>-<timestamp>`.
    if trimmed.contains('-') && trimmed.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return Ok(format!("{trimmed}@{GROUP_SERVER}"));
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 8 {
        return Err(GatewayError::InvalidPayload(format!(
            "destination '{destination}' is not a phone number or JID"
        )));
    }
    Ok(format!("{digits}@{USER_SERVER}"))
}

/// Whether a display name carries real information.
///
/// Rejects empty names, literal placeholders, and names that are just the
/// phone number written out (with or without punctuation).
pub fn is_meaningful_name(name: &str, phone: Option<&str>) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lower = trimmed.to_lowercase();
    const PLACEHOLDERS: [&str; 8] = [
        "unknown",
        "desconhecido",
        "null",
        "undefined",
        "none",
        "sem nome",
        "whatsapp user",
        ".",
    ];
    if PLACEHOLDERS.contains(&lower.as_str()) {
        return false;
    }
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    let only_phone_chars = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || " +-()".contains(c));
    if only_phone_chars && !digits.is_empty() {
        return false;
    }
    if let Some(phone) = phone {
        if !digits.is_empty() && digits == phone {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_device_and_legacy_server() {
        assert_eq!(
            normalize("5511999999999:12@s.whatsapp.net"),
            "5511999999999@s.whatsapp.net"
        );
        assert_eq!(normalize(" 5511999999999@C.US "), "5511999999999@s.whatsapp.net");
        assert_eq!(normalize("123456789@lid"), "123456789@lid");
        assert_eq!(normalize("no-at-sign"), "no-at-sign");
    }

    #[test]
    fn test_kind_classification() {
        assert_eq!(kind("5511999999999@s.whatsapp.net"), JidKind::User);
        assert_eq!(kind("120363001234567890@g.us"), JidKind::Group);
        assert_eq!(kind("98765@lid"), JidKind::Lid);
        assert_eq!(kind("status@broadcast"), JidKind::Broadcast);
        assert_eq!(kind("1234@newsletter"), JidKind::Newsletter);
        assert_eq!(kind("garbage"), JidKind::Unknown);
    }

    #[test]
    fn test_ignored_conversations() {
        assert!(is_ignored_conversation("status@broadcast"));
        assert!(is_ignored_conversation("0@s.whatsapp.net"));
        assert!(is_ignored_conversation("1700000000@broadcast"));
        assert!(!is_ignored_conversation("5511999999999@s.whatsapp.net"));
    }

    #[test]
    fn test_phone_of() {
        assert_eq!(
            phone_of("5511999999999:3@s.whatsapp.net").as_deref(),
            Some("5511999999999")
        );
        assert_eq!(phone_of("120363001234567890@g.us"), None);
        assert_eq!(phone_of("98765@lid"), None);
    }

    #[test]
    fn test_destination_jid_formats() {
        assert_eq!(
            destination_jid("+55 (11) 99999-9999").unwrap(),
            "5511999999999@s.whatsapp.net"
        );
        assert_eq!(
            destination_jid("120363001234567890@g.us").unwrap(),
            "120363001234567890@g.us"
        );
        assert_eq!(
            destination_jid("5511988887777-1600000000").unwrap(),
            "5511988887777-1600000000@g.us"
        );
        assert!(matches!(
            destination_jid("abc"),
            Err(GatewayError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_meaningful_names() {
        assert!(is_meaningful_name("Maria", Some("5511999999999")));
        assert!(!is_meaningful_name("", None));
        assert!(!is_meaningful_name("   ", None));
        assert!(!is_meaningful_name("Unknown", None));
        assert!(!is_meaningful_name("5511999999999", Some("5511999999999")));
        assert!(!is_meaningful_name("+55 11 99999-9999", Some("5511999999999")));
        assert!(is_meaningful_name("Loja 24h", Some("5511999999999")));
    }
}
