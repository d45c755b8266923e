//! Network address (JID) helpers.

pub const USER_SUFFIX: &str = "@s.whatsapp.net";
pub const GROUP_SUFFIX: &str = "@g.us";
pub const BROADCAST_SUFFIX: &str = "@broadcast";

/// Strip the network suffix and device part from an address.
///
/// `"919876543210:12@s.whatsapp.net"` becomes `"919876543210"`.
pub fn user_part(jid: &str) -> &str {
    let local = jid.split_once('@').map_or(jid, |(user, _)| user);
    local.split_once(':').map_or(local, |(user, _)| user)
}

/// Turn a caller-supplied recipient into a full address.
///
/// Full addresses pass through unchanged. Bare numbers lose formatting
/// characters and get the user suffix. Returns `None` when nothing usable
/// remains.
pub fn to_recipient(to: &str) -> Option<String> {
    let to = to.trim();
    if to.is_empty() {
        return None;
    }
    if to.contains('@') {
        return Some(to.to_string());
    }
    let digits: String = to.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    Some(format!("{digits}{USER_SUFFIX}"))
}

pub fn is_group(jid: &str) -> bool {
    jid.ends_with(GROUP_SUFFIX)
}

pub fn is_broadcast(jid: &str) -> bool {
    jid.ends_with(BROADCAST_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_part_strips_suffix_and_device() {
        assert_eq!(user_part("919876543210@s.whatsapp.net"), "919876543210");
        assert_eq!(user_part("919876543210:12@s.whatsapp.net"), "919876543210");
        assert_eq!(user_part("1203630@lid"), "1203630");
        assert_eq!(user_part("919876543210"), "919876543210");
    }

    #[test]
    fn recipient_gets_suffix() {
        assert_eq!(
            to_recipient("919876543210").as_deref(),
            Some("919876543210@s.whatsapp.net")
        );
        assert_eq!(
            to_recipient(" +91 98765-43210 ").as_deref(),
            Some("919876543210@s.whatsapp.net")
        );
    }

    #[test]
    fn full_address_passes_through() {
        assert_eq!(to_recipient("1203630@lid").as_deref(), Some("1203630@lid"));
        assert_eq!(
            to_recipient("919876543210@s.whatsapp.net").as_deref(),
            Some("919876543210@s.whatsapp.net")
        );
    }

    #[test]
    fn empty_recipient_is_rejected() {
        assert_eq!(to_recipient(""), None);
        assert_eq!(to_recipient("   "), None);
        assert_eq!(to_recipient("abc"), None);
    }

    #[test]
    fn group_and_broadcast_detection() {
        assert!(is_group("120363@g.us"));
        assert!(is_broadcast("status@broadcast"));
        assert!(!is_group("919876543210@s.whatsapp.net"));
    }
}
