use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use drive_core::ChangeEntry;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};

use super::metadata::{
    AffectedDirectories, EntryRecord, EntrySummary, LocalId, MetadataError, MetadataStore,
    join_path, path_components,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ENTRY_COLUMNS: &str = "local_id, resource_id, parent_resource_id, title, is_directory, \
     content_hash, modified, change_stamp, directory_changestamp";
const LARGEST_CHANGESTAMP_KEY: &str = "largest_changestamp";
// Guards path walks against parent cycles in corrupted data.
const MAX_PATH_DEPTH: usize = 4096;

/// [`MetadataStore`] backed by SQLite.
#[derive(Clone)]
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, MetadataError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory database. A single long-lived connection keeps the
    /// data alive for the lifetime of the store.
    pub async fn in_memory() -> Result<Self, MetadataError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), MetadataError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn count_entries(&self) -> Result<i64, MetadataError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries WHERE local_id != 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_entry_by_resource_id(
        &self,
        resource_id: &str,
    ) -> Result<Option<EntryRecord>, MetadataError> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_resource_id(&mut conn, resource_id).await
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get_local_id_by_path(&self, path: &str) -> Result<LocalId, MetadataError> {
        let not_found = || MetadataError::NotFound(path.to_string());
        let mut conn = self.pool.acquire().await?;
        let mut current = fetch_by_local_id(&mut conn, LocalId::ROOT)
            .await?
            .ok_or_else(not_found)?;
        for component in path_components(path) {
            if !current.is_directory {
                return Err(not_found());
            }
            let Some(parent_id) = current.resource_id.as_deref() else {
                return Err(not_found());
            };
            current = fetch_child(&mut conn, parent_id, component)
                .await?
                .ok_or_else(not_found)?;
        }
        Ok(current.local_id)
    }

    async fn get_entry(&self, local_id: LocalId) -> Result<Option<EntryRecord>, MetadataError> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_local_id(&mut conn, local_id).await
    }

    async fn get_path(&self, local_id: LocalId) -> Result<Option<String>, MetadataError> {
        let mut conn = self.pool.acquire().await?;
        path_of_local(&mut conn, local_id).await
    }

    async fn get_largest_local_change_stamp(&self) -> Result<i64, MetadataError> {
        let value: Option<i64> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?1")
            .bind(LARGEST_CHANGESTAMP_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_root_resource_id(&self, resource_id: &str) -> Result<(), MetadataError> {
        sqlx::query(
            "UPDATE entries SET resource_id = ?1 WHERE local_id = 1 AND resource_id IS NOT ?1",
        )
        .bind(resource_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_change_entries(
        &self,
        entries: &[ChangeEntry],
        is_full_resync: bool,
        largest_change_stamp: i64,
    ) -> Result<AffectedDirectories, MetadataError> {
        let mut tx = self.pool.begin().await?;
        let root_id = root_resource_id(&mut tx).await?;
        let mut affected = AffectedDirectories::new();
        let mut new_parents = BTreeSet::new();

        for entry in entries {
            apply_entry(
                &mut tx,
                entry,
                root_id.as_deref(),
                &mut affected,
                &mut new_parents,
            )
            .await?;
        }

        if is_full_resync {
            let listed: HashSet<&str> = entries
                .iter()
                .filter(|entry| !entry.deleted)
                .map(|entry| entry.id.as_str())
                .collect();
            let rows = sqlx::query(
                "SELECT resource_id, parent_resource_id, change_stamp FROM entries
                 WHERE local_id != 1 AND resource_id IS NOT NULL",
            )
            .fetch_all(&mut *tx)
            .await?;
            for row in rows {
                let resource_id: String = row.try_get("resource_id")?;
                let parent_id: Option<String> = row.try_get("parent_resource_id")?;
                let change_stamp: i64 = row.try_get("change_stamp")?;
                // Entries newer than the listing arrived through another
                // path after it was taken.
                if listed.contains(resource_id.as_str()) || change_stamp > largest_change_stamp {
                    continue;
                }
                if let Some(parent_id) = parent_id
                    && let Some(path) =
                        directory_path(&mut tx, &parent_id, root_id.as_deref()).await?
                {
                    affected.insert(path);
                }
                delete_subtree(&mut tx, &resource_id).await?;
                record_deletion(&mut tx, &resource_id, largest_change_stamp).await?;
            }
        }

        for parent_id in new_parents {
            if let Some(path) = directory_path(&mut tx, &parent_id, root_id.as_deref()).await? {
                affected.insert(path);
            }
        }

        sqlx::query(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
        )
        .bind(LARGEST_CHANGESTAMP_KEY)
        .bind(largest_change_stamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(affected)
    }

    async fn refresh_directory(
        &self,
        directory: LocalId,
        entries: &[ChangeEntry],
        directory_changestamp: i64,
    ) -> Result<AffectedDirectories, MetadataError> {
        let mut tx = self.pool.begin().await?;
        let dir = fetch_by_local_id(&mut tx, directory)
            .await?
            .ok_or_else(|| MetadataError::NotFound(directory.to_string()))?;
        if !dir.is_directory {
            return Err(MetadataError::NotADirectory(directory.to_string()));
        }
        let dir_id = dir
            .resource_id
            .clone()
            .ok_or_else(|| MetadataError::NotFound(directory.to_string()))?;
        let root_id = root_resource_id(&mut tx).await?;
        let mut affected = AffectedDirectories::new();
        let mut new_parents = BTreeSet::new();

        for entry in entries {
            apply_entry(
                &mut tx,
                entry,
                root_id.as_deref(),
                &mut affected,
                &mut new_parents,
            )
            .await?;
        }

        let listed: HashSet<&str> = entries.iter().map(|entry| entry.id.as_str()).collect();
        let rows = sqlx::query(
            "SELECT resource_id, change_stamp FROM entries WHERE parent_resource_id = ?1",
        )
        .bind(&dir_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in rows {
            let resource_id: String = row.try_get("resource_id")?;
            let change_stamp: i64 = row.try_get("change_stamp")?;
            if listed.contains(resource_id.as_str()) || change_stamp > directory_changestamp {
                continue;
            }
            delete_subtree(&mut tx, &resource_id).await?;
            record_deletion(&mut tx, &resource_id, directory_changestamp).await?;
        }

        sqlx::query(
            "UPDATE entries SET directory_changestamp = MAX(directory_changestamp, ?1)
             WHERE local_id = ?2",
        )
        .bind(directory_changestamp)
        .bind(directory.0)
        .execute(&mut *tx)
        .await?;

        new_parents.insert(dir_id);
        for parent_id in new_parents {
            if let Some(path) = directory_path(&mut tx, &parent_id, root_id.as_deref()).await? {
                affected.insert(path);
            }
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn read_directory_children(
        &self,
        local_id: LocalId,
    ) -> Result<Vec<EntrySummary>, MetadataError> {
        let mut conn = self.pool.acquire().await?;
        let dir = fetch_by_local_id(&mut conn, local_id)
            .await?
            .ok_or_else(|| MetadataError::NotFound(local_id.to_string()))?;
        if !dir.is_directory {
            return Err(MetadataError::NotADirectory(local_id.to_string()));
        }
        let Some(dir_id) = dir.resource_id else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries
             WHERE parent_resource_id = ?1
             ORDER BY title ASC, local_id ASC"
        ))
        .bind(&dir_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(EntrySummary::from(entry_from_row(&row)?));
        }
        Ok(out)
    }
}

async fn apply_entry(
    conn: &mut SqliteConnection,
    entry: &ChangeEntry,
    root_id: Option<&str>,
    affected: &mut AffectedDirectories,
    new_parents: &mut BTreeSet<String>,
) -> Result<(), MetadataError> {
    if root_id == Some(entry.id.as_str()) {
        return Ok(());
    }
    if !entry.deleted
        && let Some(deleted_at) = deletion_stamp(conn, &entry.id).await?
        && deleted_at >= entry.change_stamp
    {
        return Ok(());
    }
    let existing = fetch_by_resource_id(conn, &entry.id).await?;
    if let Some(existing) = &existing {
        if existing.change_stamp > entry.change_stamp {
            return Ok(());
        }
        if let Some(old_parent) = existing.parent_resource_id.as_deref()
            && let Some(path) = directory_path(conn, old_parent, root_id).await?
        {
            affected.insert(path);
        }
    }

    if entry.deleted {
        if let Some(existing) = existing {
            if existing.is_directory
                && let Some(path) = path_of_local(conn, existing.local_id).await?
            {
                affected.insert(path);
            }
            delete_subtree(conn, &entry.id).await?;
        }
        record_deletion(conn, &entry.id, entry.change_stamp).await?;
        return Ok(());
    }

    let parent_id = choose_parent(conn, entry, root_id).await?;
    sqlx::query(
        "INSERT INTO entries (
            resource_id,
            parent_resource_id,
            title,
            is_directory,
            content_hash,
            modified,
            change_stamp
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(resource_id) DO UPDATE SET
            parent_resource_id = excluded.parent_resource_id,
            title = excluded.title,
            is_directory = excluded.is_directory,
            content_hash = excluded.content_hash,
            modified = excluded.modified,
            change_stamp = excluded.change_stamp",
    )
    .bind(&entry.id)
    .bind(&parent_id)
    .bind(&entry.title)
    .bind(if entry.is_directory { 1 } else { 0 })
    .bind(&entry.content_hash)
    .bind(entry.modified)
    .bind(entry.change_stamp)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM deleted_entries WHERE resource_id = ?1")
        .bind(&entry.id)
        .execute(&mut *conn)
        .await?;

    if let Some(parent_id) = parent_id {
        new_parents.insert(parent_id);
    }
    Ok(())
}

/// Picks the parent an entry is filed under: the root when listed, else the
/// first parent already known locally, else the first listed one.
async fn choose_parent(
    conn: &mut SqliteConnection,
    entry: &ChangeEntry,
    root_id: Option<&str>,
) -> Result<Option<String>, MetadataError> {
    if let Some(root_id) = root_id
        && entry.parent_ids.contains(root_id)
    {
        return Ok(Some(root_id.to_string()));
    }
    for parent_id in &entry.parent_ids {
        if fetch_by_resource_id(conn, parent_id).await?.is_some() {
            return Ok(Some(parent_id.clone()));
        }
    }
    Ok(entry.parent_ids.iter().next().cloned())
}

async fn delete_subtree(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<(), MetadataError> {
    sqlx::query(
        "WITH RECURSIVE subtree(resource_id) AS (
            SELECT ?1
            UNION
            SELECT e.resource_id FROM entries e
            JOIN subtree s ON e.parent_resource_id = s.resource_id
        )
        DELETE FROM entries
        WHERE local_id != 1 AND resource_id IN (SELECT resource_id FROM subtree)",
    )
    .bind(resource_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn record_deletion(
    conn: &mut SqliteConnection,
    resource_id: &str,
    change_stamp: i64,
) -> Result<(), MetadataError> {
    sqlx::query(
        "INSERT INTO deleted_entries (resource_id, change_stamp) VALUES (?1, ?2)
         ON CONFLICT(resource_id) DO UPDATE SET
            change_stamp = MAX(change_stamp, excluded.change_stamp)",
    )
    .bind(resource_id)
    .bind(change_stamp)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn deletion_stamp(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<Option<i64>, MetadataError> {
    let value =
        sqlx::query_scalar("SELECT change_stamp FROM deleted_entries WHERE resource_id = ?1")
            .bind(resource_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(value)
}

async fn root_resource_id(conn: &mut SqliteConnection) -> Result<Option<String>, MetadataError> {
    let value: Option<Option<String>> =
        sqlx::query_scalar("SELECT resource_id FROM entries WHERE local_id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    Ok(value.flatten())
}

async fn fetch_by_local_id(
    conn: &mut SqliteConnection,
    local_id: LocalId,
) -> Result<Option<EntryRecord>, MetadataError> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE local_id = ?1"
    ))
    .bind(local_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(entry_from_row).transpose()?)
}

async fn fetch_by_resource_id(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<Option<EntryRecord>, MetadataError> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries WHERE resource_id = ?1"
    ))
    .bind(resource_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(entry_from_row).transpose()?)
}

async fn fetch_child(
    conn: &mut SqliteConnection,
    parent_id: &str,
    title: &str,
) -> Result<Option<EntryRecord>, MetadataError> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM entries
         WHERE parent_resource_id = ?1 AND title = ?2
         ORDER BY local_id ASC LIMIT 1"
    ))
    .bind(parent_id)
    .bind(title)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.as_ref().map(entry_from_row).transpose()?)
}

async fn path_of_local(
    conn: &mut SqliteConnection,
    local_id: LocalId,
) -> Result<Option<String>, MetadataError> {
    if local_id == LocalId::ROOT {
        return Ok(Some("/".to_string()));
    }
    let Some(entry) = fetch_by_local_id(conn, local_id).await? else {
        return Ok(None);
    };
    let Some(resource_id) = entry.resource_id else {
        return Ok(None);
    };
    let root_id = root_resource_id(conn).await?;
    directory_path(conn, &resource_id, root_id.as_deref()).await
}

/// Path of the entry with remote id `resource_id`, walking parent links up to
/// the root. `None` when the chain does not reach the root.
async fn directory_path(
    conn: &mut SqliteConnection,
    resource_id: &str,
    root_id: Option<&str>,
) -> Result<Option<String>, MetadataError> {
    let mut titles: Vec<String> = Vec::new();
    let mut current = resource_id.to_string();
    for _ in 0..MAX_PATH_DEPTH {
        if root_id == Some(current.as_str()) {
            let mut path = "/".to_string();
            for title in titles.iter().rev() {
                path = join_path(&path, title);
            }
            return Ok(Some(path));
        }
        let Some(entry) = fetch_by_resource_id(conn, &current).await? else {
            return Ok(None);
        };
        titles.push(entry.title);
        let Some(parent) = entry.parent_resource_id else {
            return Ok(None);
        };
        current = parent;
    }
    Ok(None)
}

fn entry_from_row(row: &SqliteRow) -> Result<EntryRecord, sqlx::Error> {
    let is_directory: i64 = row.try_get("is_directory")?;
    Ok(EntryRecord {
        local_id: LocalId(row.try_get("local_id")?),
        resource_id: row.try_get("resource_id")?,
        parent_resource_id: row.try_get("parent_resource_id")?,
        title: row.try_get("title")?,
        is_directory: is_directory != 0,
        content_hash: row.try_get("content_hash")?,
        modified: row.try_get("modified")?,
        change_stamp: row.try_get("change_stamp")?,
        directory_changestamp: row.try_get("directory_changestamp")?,
    })
}

/// `$XDG_DATA_HOME/drived/metadata.db`.
pub fn default_db_path() -> Result<PathBuf, MetadataError> {
    let mut path = dirs::data_dir().ok_or(MetadataError::MissingDataDir)?;
    path.push("drived");
    path.push("metadata.db");
    Ok(path)
}

#[cfg(test)]
#[path = "metadata_store_tests.rs"]
mod tests;
