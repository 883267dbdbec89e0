//! LDAP Helper Utilities
//!
//! Extension traits and utilities for working with LDAP search results,
//! reducing boilerplate code for common attribute extraction patterns.

use ldap3::SearchEntry;

use crate::ldap_utils::{is_sid_string, sid_to_string};

/// Extension trait for SearchEntry to simplify attribute extraction
///
/// Provides convenient methods to extract common attribute types
/// without repeating the verbose `.get().and_then().cloned().unwrap_or_default()` pattern.
pub trait SearchEntryExt {
    /// Get a string attribute, returning empty string if not found
    fn get_string_attr(&self, name: &str) -> String;

    /// Get an optional string attribute (returns None if missing)
    fn get_optional_attr(&self, name: &str) -> Option<String>;

    /// Get an optional u32 attribute (returns None if missing, Some(0) if value is "0")
    fn get_optional_u32_attr(&self, name: &str) -> Option<u32>;

    /// Get all values for a multi-valued attribute
    fn get_multi_attr(&self, name: &str) -> Vec<String>;

    /// Get binary attribute as bytes
    fn get_binary_attr(&self, name: &str) -> Option<Vec<u8>>;

    /// Decode `objectSid` into `S-1-...` form
    ///
    /// ldap3 places values that are not valid UTF-8 in `bin_attrs`; SIDs that
    /// happen to decode cleanly land in `attrs` instead, so both are checked.
    fn get_object_sid(&self) -> Option<String>;

    /// Get the distinguished name
    fn get_dn(&self) -> String;

    /// Check if attribute exists AND has at least one value
    fn has_values(&self, name: &str) -> bool;
}

impl SearchEntryExt for SearchEntry {
    fn get_string_attr(&self, name: &str) -> String {
        self.get_optional_attr(name).unwrap_or_default()
    }

    fn get_optional_attr(&self, name: &str) -> Option<String> {
        self.attrs
            .get(name)
            .and_then(|v| v.first())
            .cloned()
    }

    fn get_optional_u32_attr(&self, name: &str) -> Option<u32> {
        self.attrs
            .get(name)
            .and_then(|v| v.first())
            .and_then(|v| v.parse().ok())
    }

    fn get_multi_attr(&self, name: &str) -> Vec<String> {
        self.attrs
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn get_binary_attr(&self, name: &str) -> Option<Vec<u8>> {
        self.bin_attrs
            .get(name)
            .and_then(|v| v.first())
            .cloned()
    }

    fn get_object_sid(&self) -> Option<String> {
        if let Some(bytes) = self.get_binary_attr(attrs::OBJECT_SID) {
            return sid_to_string(&bytes).ok();
        }
        let text = self.get_optional_attr(attrs::OBJECT_SID)?;
        if is_sid_string(&text) {
            Some(text)
        } else {
            sid_to_string(text.as_bytes()).ok()
        }
    }

    fn get_dn(&self) -> String {
        // dn is a field on SearchEntry, not in attrs
        self.dn.clone()
    }

    fn has_values(&self, name: &str) -> bool {
        self.attrs
            .get(name)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }
}

/// Attribute names used by collection queries
pub mod attrs {
    pub const DISTINGUISHED_NAME: &str = "distinguishedName";
    pub const SAM_ACCOUNT_NAME: &str = "sAMAccountName";
    pub const SAM_ACCOUNT_TYPE: &str = "sAMAccountType";
    pub const OBJECT_SID: &str = "objectSid";
    pub const PRIMARY_GROUP_ID: &str = "primaryGroupID";
    pub const DNS_HOST_NAME: &str = "dNSHostName";
    pub const DISPLAY_NAME: &str = "displayName";
    pub const NAME: &str = "name";
    pub const GPC_FILE_SYS_PATH: &str = "gPCFileSysPath";
    pub const NETBIOS_NAME: &str = "nETBIOSName";
    pub const DNS_ROOT: &str = "dnsRoot";
    pub const CONFIGURATION_NAMING_CONTEXT: &str = "configurationNamingContext";
    pub const DEFAULT_NAMING_CONTEXT: &str = "defaultNamingContext";
}

/// Common LDAP filter patterns
pub mod filters {
    use crate::ldap_utils::escape_ldap_filter;

    /// Enabled computer accounts (machine account type, ACCOUNTDISABLE clear)
    pub const ENABLED_COMPUTERS: &str =
        "(&(sAMAccountType=805306369)(!(UserAccountControl:1.2.840.113556.1.4.803:=2)))";

    /// Every computer account, enabled or not
    pub const COMPUTER_ACCOUNTS: &str = "(sAMAccountType=805306369)";

    /// Group policy containers that carry a SYSVOL path
    pub const GPO_CONTAINERS: &str =
        "(&(objectCategory=groupPolicyContainer)(name=*)(gpcfilesyspath=*))";

    /// Partition cross-references for every domain in the forest
    pub const DOMAIN_CROSS_REFS: &str = "(&(objectClass=crossRef)(nETBIOSName=*)(dnsRoot=*))";

    /// Principal lookup by textual SID
    pub fn object_by_sid(sid: &str) -> String {
        format!("(objectSid={})", escape_ldap_filter(sid))
    }

    /// Principal lookup by account name
    pub fn object_by_sam(sam: &str) -> String {
        format!("(sAMAccountName={})", escape_ldap_filter(sam))
    }

    /// Organizational units whose gPLink references the given GPO name (`{GUID}`)
    pub fn ous_linked_to(gpo_name: &str) -> String {
        format!(
            "(&(objectCategory=organizationalUnit)(name=*)(gplink=*{}*))",
            escape_ldap_filter(gpo_name)
        )
    }
}

/// Standard attribute lists for common query types
pub mod attr_lists {
    /// Attributes needed to build a directory object
    pub const PRINCIPAL: &[&str] = &[
        "sAMAccountName",
        "distinguishedName",
        "sAMAccountType",
        "primaryGroupID",
        "dNSHostName",
        "objectSid",
    ];

    /// Computer attributes used for host lists
    pub const COMPUTER: &[&str] = &[
        "sAMAccountName",
        "distinguishedName",
        "sAMAccountType",
        "dNSHostName",
        "objectSid",
    ];

    pub const GPO: &[&str] = &["displayName", "name", "gPCFileSysPath"];

    pub const OU: &[&str] = &["distinguishedName", "name"];

    pub const CROSS_REF: &[&str] = &["nETBIOSName", "dnsRoot"];
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn create_test_entry(attrs: Vec<(&str, Vec<&str>)>) -> SearchEntry {
        let mut attr_map = HashMap::new();
        for (key, values) in attrs {
            attr_map.insert(key.to_string(), values.into_iter().map(|s| s.to_string()).collect());
        }
        SearchEntry {
            dn: "CN=WS01,OU=Workstations,DC=corp,DC=local".to_string(),
            attrs: attr_map,
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn test_get_string_attr() {
        let entry = create_test_entry(vec![("sAMAccountName", vec!["WS01$"])]);
        assert_eq!(entry.get_string_attr("sAMAccountName"), "WS01$");
        assert_eq!(entry.get_string_attr("nonexistent"), "");
    }

    #[test]
    fn test_get_optional_u32_attr() {
        let entry = create_test_entry(vec![
            ("sAMAccountType", vec!["805306369"]),
            ("zeroValue", vec!["0"]),
        ]);
        assert_eq!(entry.get_optional_u32_attr("sAMAccountType"), Some(805306369));
        assert_eq!(entry.get_optional_u32_attr("zeroValue"), Some(0));
        assert_eq!(entry.get_optional_u32_attr("nonexistent"), None);
    }

    #[test]
    fn test_get_multi_attr() {
        let entry = create_test_entry(vec![("member", vec!["CN=A,DC=test", "CN=B,DC=test"])]);
        assert_eq!(entry.get_multi_attr("member").len(), 2);
        assert_eq!(entry.get_multi_attr("nonexistent"), Vec::<String>::new());
    }

    #[test]
    fn test_get_object_sid_binary() {
        let mut entry = create_test_entry(vec![]);
        // S-1-5-32-544
        entry.bin_attrs.insert(
            "objectSid".to_string(),
            vec![vec![
                0x01, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x05, 0x20, 0x00, 0x00, 0x00, 0x20,
                0x02, 0x00, 0x00,
            ]],
        );
        assert_eq!(entry.get_object_sid().as_deref(), Some("S-1-5-32-544"));
    }

    #[test]
    fn test_get_object_sid_textual() {
        let entry = create_test_entry(vec![("objectSid", vec!["S-1-5-21-1-2-3-1104"])]);
        assert_eq!(entry.get_object_sid().as_deref(), Some("S-1-5-21-1-2-3-1104"));
        assert_eq!(create_test_entry(vec![]).get_object_sid(), None);
    }

    #[test]
    fn test_has_values() {
        let entry = create_test_entry(vec![("dNSHostName", vec!["ws01.corp.local"]), ("empty", vec![])]);
        assert!(entry.has_values("dNSHostName"));
        assert!(!entry.has_values("empty"));
        assert!(!entry.has_values("nonexistent"));
    }

    #[test]
    fn test_filters_escape_input() {
        assert_eq!(filters::object_by_sam("a*b"), "(sAMAccountName=a\\2ab)");
        assert_eq!(
            filters::ous_linked_to("{6AC1786C-016F-11D2-945F-00C04FB984F9}"),
            "(&(objectCategory=organizationalUnit)(name=*)(gplink=*{6AC1786C-016F-11D2-945F-00C04FB984F9}*))"
        );
    }
}
