//! Group policy correlation
//!
//! Derives admin grants without touching any host: every group policy whose
//! security template adds members to the built-in Administrators alias grants
//! those members admin rights on each computer in the OUs the policy is
//! linked to.

use async_trait::async_trait;
use futures::future::join_all;
use ldap3::SearchEntry;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::common_types::{AdminGrant, IdentityRecord, ObjectType};
use crate::directory::{DirectoryObject, DirectorySource};
use crate::errors::{CollectorError, Result};
use crate::identity::IdentityResolver;
use crate::ldap_helpers::{attr_lists, attrs, filters, SearchEntryExt};
use crate::ldap_utils::is_sid_string;

/// Key marker for the built-in Administrators alias member list
pub const ADMINISTRATORS_MEMBERS_KEY: &str = "S-1-5-32-544__Members";

pub const GROUP_MEMBERSHIP_SECTION: &str = "[Group Membership]";

/// Security template location relative to the policy's SYSVOL folder
pub const TEMPLATE_RELATIVE_PATH: &str = "MACHINE\\Microsoft\\Windows NT\\SecEdit\\GptTmpl.inf";

/// Decode a security template.
///
/// Templates are usually UTF-16LE with a BOM; UTF-16BE is honored by BOM,
/// anything else is read as UTF-8 with invalid sequences replaced.
pub fn decode_template(bytes: &[u8]) -> String {
    fn utf16(bytes: &[u8], from: fn([u8; 2]) -> u16) -> String {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| from([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    }

    match bytes {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8_lossy(rest).into_owned(),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Member tokens granted the Administrators alias by a template.
///
/// Only `[Group Membership]` lines are considered; tokens are trimmed of
/// whitespace and the `*` marking SID references.
pub fn parse_admin_members(text: &str) -> Vec<String> {
    let mut section = String::new();
    let mut members = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            if let Some(end) = line.find(']') {
                section = line[..=end].to_string();
            }
            continue;
        }
        if !section.eq_ignore_ascii_case(GROUP_MEMBERSHIP_SECTION) {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if !key.trim().contains(ADMINISTRATORS_MEMBERS_KEY) {
            continue;
        }
        members.extend(
            value
                .split(',')
                .map(|token| token.trim().trim_matches('*').trim())
                .filter(|token| !token.is_empty())
                .map(str::to_string),
        );
    }
    members
}

/// Source of policy security templates
#[async_trait]
pub trait TemplateReader: Send + Sync {
    /// Raw template bytes for a policy folder, None when it has no template
    async fn read_template(&self, gpc_file_sys_path: &str) -> Result<Option<Vec<u8>>>;
}

/// Reads templates from SYSVOL, optionally through a local mount point
pub struct FsTemplateReader {
    sysvol_root: Option<PathBuf>,
}

impl FsTemplateReader {
    pub fn new(sysvol_root: Option<PathBuf>) -> Self {
        Self { sysvol_root }
    }

    /// `\\server\SYSVOL\rest` maps to `<root>/rest` when a mount point is set
    pub fn template_path(&self, gpc_file_sys_path: &str) -> PathBuf {
        match &self.sysvol_root {
            Some(root) => {
                let mut path = root.clone();
                gpc_file_sys_path
                    .split('\\')
                    .filter(|part| !part.is_empty())
                    // server and share
                    .skip(2)
                    .chain(TEMPLATE_RELATIVE_PATH.split('\\'))
                    .for_each(|part| path.push(part));
                path
            }
            None => PathBuf::from(format!("{}\\{}", gpc_file_sys_path, TEMPLATE_RELATIVE_PATH)),
        }
    }
}

#[async_trait]
impl TemplateReader for FsTemplateReader {
    async fn read_template(&self, gpc_file_sys_path: &str) -> Result<Option<Vec<u8>>> {
        let path = self.template_path(gpc_file_sys_path);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CollectorError::NotFound(format!(
                "Cannot read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

pub struct GpoCorrelator {
    directory: Arc<dyn DirectorySource>,
    identities: Arc<IdentityResolver>,
    reader: Arc<dyn TemplateReader>,
    parallelism: usize,
}

impl GpoCorrelator {
    pub fn new(
        directory: Arc<dyn DirectorySource>,
        identities: Arc<IdentityResolver>,
        reader: Arc<dyn TemplateReader>,
        parallelism: usize,
    ) -> Self {
        Self {
            directory,
            identities,
            reader,
            parallelism: parallelism.max(1),
        }
    }

    /// Correlate every policy in `domain`, streaming grants into `output`.
    ///
    /// Policies are processed concurrently; a failing policy is logged and
    /// skipped. Returns the number of grants emitted.
    pub async fn correlate(&self, domain: &str, output: &UnboundedSender<AdminGrant>) -> Result<usize> {
        info!("Starting GPO correlation for {}", domain);
        let start = Instant::now();

        let gpos = self
            .directory
            .find(domain, None, filters::GPO_CONTAINERS, attr_lists::GPO)
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let futures: Vec<_> = gpos
            .iter()
            .map(|gpo| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|e| CollectorError::InternalError(format!("Semaphore error: {}", e)))?;
                    self.correlate_gpo(domain, gpo, output).await
                }
            })
            .collect();

        let mut emitted = 0;
        for (gpo, result) in gpos.iter().zip(join_all(futures).await) {
            match result {
                Ok(count) => emitted += count,
                Err(e) => warn!("GPO {} skipped: {}", gpo.get_dn(), e),
            }
        }

        info!(
            "GPO correlation for {} done: {} policies, {} grants in {:?}",
            domain,
            gpos.len(),
            emitted,
            start.elapsed()
        );
        Ok(emitted)
    }

    async fn correlate_gpo(
        &self,
        domain: &str,
        gpo: &SearchEntry,
        output: &UnboundedSender<AdminGrant>,
    ) -> Result<usize> {
        let (Some(display_name), Some(name), Some(path)) = (
            gpo.get_optional_attr(attrs::DISPLAY_NAME),
            gpo.get_optional_attr(attrs::NAME),
            gpo.get_optional_attr(attrs::GPC_FILE_SYS_PATH),
        ) else {
            return Ok(0);
        };

        let Some(bytes) = self.reader.read_template(&path).await? else {
            return Ok(0);
        };
        let tokens = parse_admin_members(&decode_template(&bytes));
        if tokens.is_empty() {
            return Ok(0);
        }

        let principals = self.resolve_tokens(domain, &tokens).await;
        if principals.is_empty() {
            return Ok(0);
        }
        debug!("GPO {} grants admin to {} principals", display_name, principals.len());

        let ous = self
            .directory
            .find(domain, None, &filters::ous_linked_to(&name), attr_lists::OU)
            .await?;

        let mut emitted = 0;
        for ou in &ous {
            let computers = self
                .directory
                .find(domain, Some(&ou.get_dn()), filters::COMPUTER_ACCOUNTS, attr_lists::COMPUTER)
                .await?;
            for computer in computers.iter().filter_map(DirectoryObject::from_entry) {
                if computer.object_type != ObjectType::Computer {
                    continue;
                }
                for principal in &principals {
                    if let Some(grant) = AdminGrant::new(computer.display_name.clone(), principal) {
                        output.send(grant).map_err(|_| {
                            CollectorError::InternalError("Output queue closed".to_string())
                        })?;
                        emitted += 1;
                    }
                }
            }
        }
        Ok(emitted)
    }

    async fn resolve_tokens(&self, domain: &str, tokens: &[String]) -> Vec<IdentityRecord> {
        let mut principals = Vec::new();
        for token in tokens {
            let sid = if is_sid_string(token) {
                token.clone()
            } else {
                match self.identities.translate_name(domain, token).await {
                    Some(sid) => sid,
                    None => {
                        debug!("Could not translate {} in {}", token, domain);
                        continue;
                    }
                }
            };
            match self.identities.resolve(&sid, domain, None).await {
                Ok(record) => principals.push(record),
                Err(e) => debug!("Dropping {}: {}", sid, e),
            }
        }
        principals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "[Unicode]\r\nUnicode=yes\r\n[Version]\r\nsignature=\"$CHICAGO$\"\r\nRevision=1\r\n\
[Group Membership]\r\n*S-1-5-32-544__Memberof =\r\n\
*S-1-5-32-544__Members = *S-1-5-21-1-2-3-1200,IT Admins , *S-1-5-21-1-2-3-1104\r\n\
*S-1-5-32-555__Members = *S-1-5-21-1-2-3-1300\r\n\
[Privilege Rights]\r\nSeInteractiveLogonRight = *S-1-5-21-1-2-3-1400\r\n";

    #[test]
    fn test_parse_admin_members() {
        assert_eq!(
            parse_admin_members(TEMPLATE),
            vec!["S-1-5-21-1-2-3-1200", "IT Admins", "S-1-5-21-1-2-3-1104"]
        );
    }

    #[test]
    fn test_parse_ignores_other_sections() {
        let text = "[Privilege Rights]\n*S-1-5-32-544__Members = *S-1-5-21-1-2-3-9\n";
        assert!(parse_admin_members(text).is_empty());
        assert!(parse_admin_members("").is_empty());
    }

    #[test]
    fn test_decode_utf16le_template() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in TEMPLATE.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_template(&bytes), TEMPLATE);
        assert_eq!(decode_template(TEMPLATE.as_bytes()), TEMPLATE);
    }

    #[test]
    fn test_template_path_with_sysvol_root() {
        let reader = FsTemplateReader::new(Some(PathBuf::from("/mnt/sysvol")));
        let path = reader.template_path(
            "\\\\corp.local\\SysVol\\corp.local\\Policies\\{31B2F340-016D-11D2-945F-00C04FB984F9}",
        );
        assert_eq!(
            path,
            PathBuf::from(
                "/mnt/sysvol/corp.local/Policies/{31B2F340-016D-11D2-945F-00C04FB984F9}/MACHINE/Microsoft/Windows NT/SecEdit/GptTmpl.inf"
            )
        );
    }

    #[tokio::test]
    async fn test_fs_reader_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let reader = FsTemplateReader::new(Some(dir.path().to_path_buf()));
        let result = reader
            .read_template("\\\\corp.local\\SYSVOL\\corp.local\\Policies\\{X}")
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
