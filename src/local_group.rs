//! Remote local-group queries
//!
//! Two independent mechanisms read a host's local Administrators group:
//! the structured member query (SID, `DOMAIN\name`, SID use) and a legacy
//! provider that only yields member SIDs. Both are exposed as traits so the
//! resolver can switch on the returned error kind.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{CollectorError, Result};

/// RPC_S_SERVER_UNAVAILABLE
pub const RPC_S_SERVER_UNAVAILABLE: u32 = 1722;

pub const ADMINISTRATORS_GROUP: &str = "Administrators";

/// One entry of a structured local group query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalGroupMember {
    /// None when the SID could not be converted to string form
    pub sid: Option<String>,
    /// `DOMAIN\account` as reported by the host
    pub domain_and_name: String,
    /// Raw SID_NAME_USE code
    pub sid_use: i32,
}

/// Structured member query (primary strategy)
#[async_trait]
pub trait LocalGroupApi: Send + Sync {
    /// Fails with `HostUnreachable` on transport failure and
    /// `EnumerationUnsupported` for any other non-success status.
    async fn get_members(&self, host: &str, group: &str) -> Result<Vec<LocalGroupMember>>;
}

/// Legacy provider interface (fallback strategy)
#[async_trait]
pub trait LegacyGroupProvider: Send + Sync {
    async fn member_sids(&self, host: &str, group: &str) -> Result<Vec<String>>;
}

/// Map a NetAPI status code to the error kind the resolver switches on
pub fn classify_status(host: &str, status: u32) -> Result<()> {
    match status {
        0 => Ok(()),
        RPC_S_SERVER_UNAVAILABLE => Err(CollectorError::HostUnreachable(format!(
            "{}: RPC server unavailable",
            host
        ))),
        other => Err(CollectorError::EnumerationUnsupported(format!(
            "{}: status {}",
            host, other
        ))),
    }
}

#[cfg(windows)]
pub use windows_impl::{NetApiLegacyProvider, NetApiLocalGroups};

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::ldap_utils::sid_to_string;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::PSID;
    use windows::Win32::NetworkManagement::NetManagement::{
        NetApiBufferFree, NetLocalGroupGetMembers, LOCALGROUP_MEMBERS_INFO_0,
        LOCALGROUP_MEMBERS_INFO_2, MAX_PREFERRED_LENGTH,
    };
    use windows::Win32::Security::GetLengthSid;

    fn to_wide(value: &str) -> Vec<u16> {
        value.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn pwstr_to_string(ptr: *const u16) -> String {
        if ptr.is_null() {
            return String::new();
        }
        const MAX_LEN: usize = 1024;
        unsafe {
            let mut len = 0;
            while len < MAX_LEN && *ptr.add(len) != 0 {
                len += 1;
            }
            String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
        }
    }

    /// # Safety
    /// `sid` must point to a valid SID structure.
    unsafe fn psid_to_string(sid: PSID) -> Option<String> {
        if sid.0.is_null() {
            return None;
        }
        let len = GetLengthSid(sid) as usize;
        let bytes = std::slice::from_raw_parts(sid.0 as *const u8, len);
        sid_to_string(bytes).ok()
    }

    /// Runs NetLocalGroupGetMembers at `level`, handing the raw entries to `read`.
    fn get_members_raw<T, R>(host: &str, group: &str, level: u32, read: R) -> Result<Vec<T>>
    where
        R: Fn(*const u8, usize) -> Vec<T>,
    {
        let server = to_wide(host);
        let group_name = to_wide(group);
        let mut buffer: *mut u8 = std::ptr::null_mut();
        let mut entries_read: u32 = 0;
        let mut total_entries: u32 = 0;

        let status = unsafe {
            NetLocalGroupGetMembers(
                PCWSTR(server.as_ptr()),
                PCWSTR(group_name.as_ptr()),
                level,
                &mut buffer,
                MAX_PREFERRED_LENGTH,
                &mut entries_read,
                &mut total_entries,
                None,
            )
        };

        let members = if status == 0 && !buffer.is_null() {
            read(buffer, entries_read as usize)
        } else {
            Vec::new()
        };

        if !buffer.is_null() {
            unsafe {
                let _ = NetApiBufferFree(Some(buffer as *const _));
            }
        }

        classify_status(host, status)?;
        Ok(members)
    }

    /// Level-2 member query
    pub struct NetApiLocalGroups;

    #[async_trait]
    impl LocalGroupApi for NetApiLocalGroups {
        async fn get_members(&self, host: &str, group: &str) -> Result<Vec<LocalGroupMember>> {
            let host = host.to_string();
            let group = group.to_string();
            tokio::task::spawn_blocking(move || {
                get_members_raw(&host, &group, 2, |buffer, count| {
                    let entries = unsafe {
                        std::slice::from_raw_parts(buffer as *const LOCALGROUP_MEMBERS_INFO_2, count)
                    };
                    entries
                        .iter()
                        .map(|entry| LocalGroupMember {
                            sid: unsafe { psid_to_string(entry.lgrmi2_sid) },
                            domain_and_name: pwstr_to_string(entry.lgrmi2_domainandname.0),
                            sid_use: entry.lgrmi2_sidusage.0,
                        })
                        .collect()
                })
            })
            .await?
        }
    }

    /// Level-0 member query; SIDs only
    pub struct NetApiLegacyProvider;

    #[async_trait]
    impl LegacyGroupProvider for NetApiLegacyProvider {
        async fn member_sids(&self, host: &str, group: &str) -> Result<Vec<String>> {
            let host = host.to_string();
            let group = group.to_string();
            tokio::task::spawn_blocking(move || {
                get_members_raw(&host, &group, 0, |buffer, count| {
                    let entries = unsafe {
                        std::slice::from_raw_parts(buffer as *const LOCALGROUP_MEMBERS_INFO_0, count)
                    };
                    entries
                        .iter()
                        .filter_map(|entry| unsafe { psid_to_string(entry.lgrmi0_sid) })
                        .collect()
                })
            })
            .await?
            .map_err(|e| CollectorError::HostUnreachable(e.to_string()))
        }
    }
}

/// Stand-in for platforms without the remote group APIs.
///
/// The primary query reports unsupported and the legacy provider reports the
/// host unreachable, so every host is counted dead without probing further.
pub struct UnsupportedPlatform;

#[async_trait]
impl LocalGroupApi for UnsupportedPlatform {
    async fn get_members(&self, host: &str, _group: &str) -> Result<Vec<LocalGroupMember>> {
        Err(CollectorError::EnumerationUnsupported(format!(
            "{}: remote local group queries are not available on this platform",
            host
        )))
    }
}

#[async_trait]
impl LegacyGroupProvider for UnsupportedPlatform {
    async fn member_sids(&self, host: &str, _group: &str) -> Result<Vec<String>> {
        Err(CollectorError::HostUnreachable(format!(
            "{}: legacy group provider is not available on this platform",
            host
        )))
    }
}
