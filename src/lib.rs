//! Local administrator collection for Active Directory environments
//!
//! Enumerates the local Administrators group of every computer in one or
//! more domains (or derives it from group policy in stealth mode), resolves
//! member SIDs to directory identities and streams `AdminTo` relationships to
//! a CSV file or a graph database.

pub mod admin_resolver;
pub mod cache;
pub mod common_types;
pub mod config;
pub mod directory;
pub mod dispatcher;
pub mod enumeration;
pub mod errors;
pub mod gpo_correlator;
pub mod host_gate;
pub mod identity;
pub mod ldap_helpers;
pub mod ldap_utils;
pub mod local_group;
pub mod object_store;
pub mod output;
pub mod progress;
pub mod secure_types;

pub use config::CollectorConfig;
pub use enumeration::{Collaborators, LocalAdminEnumeration, ScanContext};
pub use errors::{CollectorError, Result};
