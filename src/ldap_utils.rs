//! LDAP Utilities
//!
//! RFC 4515 filter escaping, binary SID decoding (MS-DTYP 2.4.2) and the
//! string helpers used to reason about SID prefixes and directory names.

/// Escapes a string for safe use in an LDAP search filter (RFC 4515).
///
/// The following characters are escaped:
/// - `*` (asterisk) -> `\2a`
/// - `(` (left parenthesis) -> `\28`
/// - `)` (right parenthesis) -> `\29`
/// - `\` (backslash) -> `\5c`
/// - `\0` (NUL) -> `\00`
pub fn escape_ldap_filter(input: &str) -> String {
    input.chars().fold(String::new(), |mut acc, c| {
        match c {
            '*' => acc.push_str("\\2a"),
            '(' => acc.push_str("\\28"),
            ')' => acc.push_str("\\29"),
            '\\' => acc.push_str("\\5c"),
            '\0' => acc.push_str("\\00"),
            _ => acc.push(c),
        }
        acc
    })
}

/// Convert a binary SID to string format (S-1-5-21-...)
///
/// # Format (MS-DTYP 2.4.2):
/// ```text
/// Offset  Size  Field
/// 0       1     Revision
/// 1       1     SubAuthorityCount
/// 2       6     IdentifierAuthority
/// 8       4*N   SubAuthorities (N = SubAuthorityCount)
/// ```
pub fn sid_to_string(bytes: &[u8]) -> Result<String, String> {
    if bytes.len() < 8 {
        return Err("SID too short (minimum 8 bytes)".to_string());
    }

    let revision = bytes[0];
    let sub_auth_count = bytes[1] as usize;

    if bytes.len() < 8 + (sub_auth_count * 4) {
        return Err(format!(
            "SID data insufficient for {} sub-authorities",
            sub_auth_count
        ));
    }

    // 48-bit identifier authority (big-endian)
    let id_auth = u64::from_be_bytes([
        0, 0, bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]);

    let mut sid = format!("S-{}-{}", revision, id_auth);

    // Sub-authorities (little-endian)
    for i in 0..sub_auth_count {
        let offset = 8 + (i * 4);
        let sub_auth = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]);
        sid.push_str(&format!("-{}", sub_auth));
    }

    Ok(sid)
}

/// True when the string is in `S-1-...` form
pub fn is_sid_string(value: &str) -> bool {
    value.starts_with("S-1-")
}

/// Everything before the final `-` (the domain or machine portion of a SID).
pub fn sid_prefix(sid: &str) -> Option<&str> {
    sid.rfind('-').map(|idx| &sid[..idx]).filter(|p| !p.is_empty())
}

/// The trailing relative identifier of a SID
pub fn sid_rid(sid: &str) -> Option<u32> {
    sid.rsplit('-').next().and_then(|rid| rid.parse().ok())
}

/// Derive a DNS domain name from the `DC=` components of a distinguished name.
///
/// `CN=WS01,OU=Workstations,DC=corp,DC=local` -> `corp.local`
pub fn domain_from_dn(dn: &str) -> Option<String> {
    let parts: Vec<&str> = dn
        .split(',')
        .map(str::trim)
        .filter_map(|rdn| {
            let (key, value) = rdn.split_once('=')?;
            key.eq_ignore_ascii_case("DC").then_some(value)
        })
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("."))
    }
}

/// Convert a DNS domain name to an LDAP base DN
/// e.g., "corp.example.com" -> "DC=corp,DC=example,DC=com"
pub fn domain_to_base_dn(domain: &str) -> String {
    domain
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| format!("DC={}", part))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_ldap_filter() {
        assert_eq!(escape_ldap_filter("admin*"), "admin\\2a");
        assert_eq!(escape_ldap_filter("test(value)"), "test\\28value\\29");
        assert_eq!(escape_ldap_filter("path\\to"), "path\\5cto");
        assert_eq!(escape_ldap_filter("test\0value"), "test\\00value");
        assert_eq!(
            escape_ldap_filter("{31B2F340-016D-11D2-945F-00C04FB984F9}"),
            "{31B2F340-016D-11D2-945F-00C04FB984F9}"
        );
    }

    #[test]
    fn test_sid_to_string_builtin_administrators() {
        // S-1-5-32-544
        let bytes = [
            0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00, 0x20, 0x02,
            0x00, 0x00,
        ];
        assert_eq!(sid_to_string(&bytes).unwrap(), "S-1-5-32-544");
    }

    #[test]
    fn test_sid_to_string_rejects_truncated() {
        assert!(sid_to_string(&[0x01, 0x02, 0x00]).is_err());
        // claims two sub-authorities but carries one
        let bytes = [0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00];
        assert!(sid_to_string(&bytes).is_err());
    }

    #[test]
    fn test_sid_prefix_and_rid() {
        assert_eq!(sid_prefix("S-1-5-21-1-2-3-500"), Some("S-1-5-21-1-2-3"));
        assert_eq!(sid_rid("S-1-5-21-1-2-3-500"), Some(500));
        assert_eq!(sid_prefix("nodash"), None);
        assert_eq!(sid_rid("S-1-5-21-x"), None);
    }

    #[test]
    fn test_domain_from_dn() {
        assert_eq!(
            domain_from_dn("CN=WS01,OU=Workstations,DC=corp,DC=local").as_deref(),
            Some("corp.local")
        );
        assert_eq!(domain_from_dn("CN=Orphan"), None);
    }

    #[test]
    fn test_domain_to_base_dn() {
        assert_eq!(domain_to_base_dn("corp.example.com"), "DC=corp,DC=example,DC=com");
    }
}
