//! Object store
//!
//! Directory objects keyed by (SID, domain scope). Inserts are idempotent and
//! first-write-wins, so concurrent workers resolving the same SID agree on
//! one stored value. Two backends: an in-memory map for single runs and a
//! SQLite database that persists between runs.

use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::common_types::{Host, ObjectType};
use crate::directory::DirectoryObject;
use crate::errors::{CollectorError, Result};

pub trait ObjectStore: Send + Sync {
    fn find_by_sid(&self, sid: &str, scope: &str) -> Result<Option<DirectoryObject>>;

    /// Insert unless (sid, scope) is already stored; returns the stored object.
    fn insert(&self, object: &DirectoryObject, scope: &str) -> Result<DirectoryObject>;

    /// Every computer whose owning domain is `domain`
    fn computers_in_domain(&self, domain: &str) -> Result<Vec<Host>>;

    fn find_user_by_sid(&self, sid: &str, scope: &str) -> Result<Option<DirectoryObject>> {
        self.find_typed(sid, scope, ObjectType::User)
    }

    fn find_group_by_sid(&self, sid: &str, scope: &str) -> Result<Option<DirectoryObject>> {
        self.find_typed(sid, scope, ObjectType::Group)
    }

    fn find_computer_by_sid(&self, sid: &str, scope: &str) -> Result<Option<DirectoryObject>> {
        self.find_typed(sid, scope, ObjectType::Computer)
    }

    fn find_typed(
        &self,
        sid: &str,
        scope: &str,
        object_type: ObjectType,
    ) -> Result<Option<DirectoryObject>> {
        Ok(self
            .find_by_sid(sid, scope)?
            .filter(|object| object.object_type == object_type))
    }
}

fn store_key(sid: &str, scope: &str) -> (String, String) {
    (sid.to_string(), scope.to_uppercase())
}

/// Run-scoped in-memory store
#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<(String, String), DirectoryObject>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn find_by_sid(&self, sid: &str, scope: &str) -> Result<Option<DirectoryObject>> {
        Ok(self
            .objects
            .get(&store_key(sid, scope))
            .map(|entry| entry.value().clone()))
    }

    fn insert(&self, object: &DirectoryObject, scope: &str) -> Result<DirectoryObject> {
        Ok(self
            .objects
            .entry(store_key(&object.sid, scope))
            .or_insert_with(|| object.clone())
            .value()
            .clone())
    }

    fn computers_in_domain(&self, domain: &str) -> Result<Vec<Host>> {
        let mut seen = HashSet::new();
        let mut hosts: Vec<Host> = self
            .objects
            .iter()
            .filter(|entry| entry.value().domain.eq_ignore_ascii_case(domain))
            .filter_map(|entry| entry.value().to_host())
            .filter(|host| seen.insert(host.sid.clone()))
            .collect();
        hosts.sort_by(|a, b| a.dns_host_name.cmp(&b.dns_host_name));
        Ok(hosts)
    }
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening object store at: {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Avoid hangs when the database is locked (5 seconds)
        conn.pragma_update(None, "busy_timeout", "5000")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CollectorError::StoreError(format!("Failed to acquire store lock: {}", e)))
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS directory_objects (
                sid TEXT NOT NULL,
                scope TEXT NOT NULL,
                display_name TEXT NOT NULL,
                object_type TEXT NOT NULL,
                domain TEXT NOT NULL,
                sam_account_name TEXT NOT NULL,
                dns_host_name TEXT,
                distinguished_name TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                PRIMARY KEY (sid, scope)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_domain_type
                ON directory_objects(domain, object_type)",
            [],
        )?;
        Ok(())
    }

    fn row_to_object(row: &rusqlite::Row<'_>) -> rusqlite::Result<(DirectoryObject, String)> {
        let object_type: String = row.get(2)?;
        Ok((
            DirectoryObject {
                sid: row.get(0)?,
                display_name: row.get(1)?,
                // Placeholder; the caller validates the stored type string
                object_type: ObjectType::User,
                domain: row.get(3)?,
                sam_account_name: row.get(4)?,
                dns_host_name: row.get(5)?,
                distinguished_name: row.get(6)?,
            },
            object_type,
        ))
    }

    fn typed((mut object, object_type): (DirectoryObject, String)) -> Result<DirectoryObject> {
        object.object_type = ObjectType::parse(&object_type).ok_or_else(|| {
            CollectorError::StoreError(format!("Unknown object type '{}' for {}", object_type, object.sid))
        })?;
        Ok(object)
    }
}

const SELECT_COLUMNS: &str =
    "SELECT sid, display_name, object_type, domain, sam_account_name, dns_host_name, distinguished_name
     FROM directory_objects";

impl ObjectStore for SqliteStore {
    fn find_by_sid(&self, sid: &str, scope: &str) -> Result<Option<DirectoryObject>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("{} WHERE sid = ?1 AND scope = ?2", SELECT_COLUMNS),
                params![sid, scope.to_uppercase()],
                Self::row_to_object,
            )
            .optional()?;
        row.map(Self::typed).transpose()
    }

    fn insert(&self, object: &DirectoryObject, scope: &str) -> Result<DirectoryObject> {
        {
            let conn = self.lock()?;
            conn.execute(
                "INSERT OR IGNORE INTO directory_objects
                    (sid, scope, display_name, object_type, domain, sam_account_name, dns_host_name, distinguished_name, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    object.sid,
                    scope.to_uppercase(),
                    object.display_name,
                    object.object_type.as_str(),
                    object.domain,
                    object.sam_account_name,
                    object.dns_host_name,
                    object.distinguished_name,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
        }
        self.find_by_sid(&object.sid, scope)?
            .ok_or_else(|| CollectorError::StoreError(format!("Insert of {} was not persisted", object.sid)))
    }

    fn computers_in_domain(&self, domain: &str) -> Result<Vec<Host>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE object_type = 'computer' AND domain = ?1 COLLATE NOCASE
             GROUP BY sid ORDER BY dns_host_name, display_name",
            SELECT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![domain], Self::row_to_object)?;

        let mut hosts = Vec::new();
        for row in rows {
            if let Some(host) = Self::typed(row?)?.to_host() {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }
}
