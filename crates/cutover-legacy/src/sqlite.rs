//! SQLite-backed legacy store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cutover_repo::ProjectName;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use tracing::debug;

use crate::{
    AccountId, Change, ChangeBundle, ChangeId, ChangeMessage, ChangeStatus, Comment,
    CommentStatus, LegacyError, LegacySource, LegacyStore, LogState, PatchSet, PatchSetApproval,
    PatchSetId,
};

pub const LEGACY_SCHEMA_VERSION: i64 = 1;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CHANGE_COLUMNS: &str = "change_id, project, owner_account_id, subject, topic, status, \
                              created_on, last_updated_on, log_state";

/// Legacy store in a SQLite database file.
///
/// Async methods run their queries on the blocking thread pool.
pub struct SqliteLegacyStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLegacyStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LegacyError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, LegacyError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, LegacyError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), LegacyError> {
        let conn = self.lock();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > LEGACY_SCHEMA_VERSION {
            return Err(LegacyError::InvalidColumn {
                column: "user_version",
                value: current.to_string(),
            });
        }
        if current < 1 {
            conn.execute_batch(include_str!("../migrations/0001_legacy_schema.sql"))?;
            conn.execute("PRAGMA user_version = 1", [])?;
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        lock_conn(&self.conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, LegacyError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, LegacyError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock_conn(&conn);
            f(&mut *conn)
        })
        .await?
    }

    /// Insert a change with all its rows in one transaction.
    ///
    /// The legacy sequence is moved past the change's id.
    pub fn insert(&self, bundle: &ChangeBundle) -> Result<(), LegacyError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let c = &bundle.change;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM changes WHERE change_id = ?1",
                params![c.id.0],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(LegacyError::ChangeExists(c.id));
        }

        let log_state = c.log_state.as_ref().map(serde_json::to_string).transpose()?;
        tx.execute(
            "INSERT INTO changes (change_id, project, owner_account_id, subject, topic, status,
                                  created_on, last_updated_on, log_state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                c.id.0,
                c.project.as_str(),
                c.owner.0,
                c.subject,
                c.topic,
                c.status.as_str(),
                c.created_on.to_rfc3339(),
                c.last_updated_on.to_rfc3339(),
                log_state,
            ],
        )?;
        for ps in &bundle.patch_sets {
            tx.execute(
                "INSERT INTO patch_sets (change_id, patch_set_id, revision, uploader_account_id,
                                         created_on)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    ps.id.change.0,
                    ps.id.number,
                    ps.revision,
                    ps.uploader.0,
                    ps.created_on.to_rfc3339(),
                ],
            )?;
        }
        for a in &bundle.approvals {
            tx.execute(
                "INSERT INTO patch_set_approvals (change_id, patch_set_id, account_id,
                                                  category_id, value, granted)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    a.patch_set.change.0,
                    a.patch_set.number,
                    a.account.0,
                    a.label,
                    a.value,
                    a.granted.to_rfc3339(),
                ],
            )?;
        }
        for m in &bundle.messages {
            tx.execute(
                "INSERT INTO change_messages (change_id, uuid, author_id, written_on, message,
                                              patch_set_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    c.id.0,
                    m.uuid,
                    m.author.map(|a| a.0),
                    m.written_on.to_rfc3339(),
                    m.message,
                    m.patch_set.map(|ps| ps.number),
                ],
            )?;
        }
        for cm in &bundle.comments {
            tx.execute(
                "INSERT INTO patch_comments (change_id, patch_set_id, uuid, author_id, written_on,
                                             file_name, line_nbr, message, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    cm.patch_set.change.0,
                    cm.patch_set.number,
                    cm.uuid,
                    cm.author.0,
                    cm.written_on.to_rfc3339(),
                    cm.file,
                    cm.line,
                    cm.message,
                    comment_status_as_str(cm.status),
                ],
            )?;
        }
        let after = c.id.0.checked_add(1).ok_or(LegacyError::SequenceExhausted(c.id.0))?;
        tx.execute(
            "UPDATE change_id_sequence SET next_id = MAX(next_id, ?1)",
            params![after],
        )?;
        tx.commit()?;
        debug!(change = %c.id, project = %c.project, "inserted legacy change");
        Ok(())
    }

    fn query_changes(
        conn: &Connection,
        where_clause: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Change>, LegacyError> {
        let sql = format!(
            "SELECT {} FROM changes {} ORDER BY change_id",
            CHANGE_COLUMNS, where_clause
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok(ChangeRow {
                id: row.get(0)?,
                project: row.get(1)?,
                owner: row.get(2)?,
                subject: row.get(3)?,
                topic: row.get(4)?,
                status: row.get(5)?,
                created_on: row.get(6)?,
                last_updated_on: row.get(7)?,
                log_state: row.get(8)?,
            })
        })?;
        let mut changes = Vec::new();
        for row in rows {
            changes.push(row?.into_change()?);
        }
        Ok(changes)
    }

    fn query_patch_sets(conn: &Connection, id: ChangeId) -> Result<Vec<PatchSet>, LegacyError> {
        let mut stmt = conn.prepare(
            "SELECT patch_set_id, revision, uploader_account_id, created_on
             FROM patch_sets WHERE change_id = ?1 ORDER BY patch_set_id",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (number, revision, uploader, created_on) = row?;
            out.push(PatchSet {
                id: PatchSetId { change: id, number },
                revision,
                uploader: AccountId(uploader),
                created_on: parse_ts(&created_on)?,
            });
        }
        Ok(out)
    }

    fn query_approvals(
        conn: &Connection,
        id: ChangeId,
    ) -> Result<Vec<PatchSetApproval>, LegacyError> {
        let mut stmt = conn.prepare(
            "SELECT patch_set_id, account_id, category_id, value, granted
             FROM patch_set_approvals WHERE change_id = ?1
             ORDER BY patch_set_id, account_id, category_id",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i16>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (number, account, label, value, granted) = row?;
            out.push(PatchSetApproval {
                patch_set: PatchSetId { change: id, number },
                account: AccountId(account),
                label,
                value,
                granted: parse_ts(&granted)?,
            });
        }
        Ok(out)
    }

    fn query_messages(conn: &Connection, id: ChangeId) -> Result<Vec<ChangeMessage>, LegacyError> {
        let mut stmt = conn.prepare(
            "SELECT uuid, author_id, written_on, message, patch_set_id
             FROM change_messages WHERE change_id = ?1 ORDER BY written_on, uuid",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<u32>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<u32>>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (uuid, author, written_on, message, patch_set) = row?;
            out.push(ChangeMessage {
                uuid,
                author: author.map(AccountId),
                written_on: parse_ts(&written_on)?,
                message,
                patch_set: patch_set.map(|number| PatchSetId { change: id, number }),
            });
        }
        Ok(out)
    }

    fn query_comments(conn: &Connection, id: ChangeId) -> Result<Vec<Comment>, LegacyError> {
        let mut stmt = conn.prepare(
            "SELECT patch_set_id, uuid, author_id, written_on, file_name, line_nbr, message, status
             FROM patch_comments WHERE change_id = ?1 ORDER BY written_on, uuid",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<u32>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (number, uuid, author, written_on, file, line, message, status) = row?;
            out.push(Comment {
                uuid,
                patch_set: PatchSetId { change: id, number },
                author: AccountId(author),
                written_on: parse_ts(&written_on)?,
                file,
                line,
                message,
                status: parse_comment_status(&status)?,
            });
        }
        Ok(out)
    }
}

fn lock_conn(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|e| e.into_inner())
}

struct ChangeRow {
    id: u32,
    project: String,
    owner: u32,
    subject: String,
    topic: Option<String>,
    status: String,
    created_on: String,
    last_updated_on: String,
    log_state: Option<String>,
}

impl ChangeRow {
    fn into_change(self) -> Result<Change, LegacyError> {
        let status = ChangeStatus::parse(&self.status).ok_or(LegacyError::InvalidColumn {
            column: "changes.status",
            value: self.status.clone(),
        })?;
        let log_state = self
            .log_state
            .as_deref()
            .map(serde_json::from_str::<LogState>)
            .transpose()?;
        Ok(Change {
            id: ChangeId(self.id),
            project: ProjectName::new(self.project),
            owner: AccountId(self.owner),
            subject: self.subject,
            topic: self.topic,
            status,
            created_on: parse_ts(&self.created_on)?,
            last_updated_on: parse_ts(&self.last_updated_on)?,
            log_state,
        })
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, LegacyError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| LegacyError::Timestamp(format!("{value}: {err}")))
}

fn comment_status_as_str(status: CommentStatus) -> &'static str {
    match status {
        CommentStatus::Draft => "draft",
        CommentStatus::Published => "published",
    }
}

fn parse_comment_status(value: &str) -> Result<CommentStatus, LegacyError> {
    match value {
        "draft" => Ok(CommentStatus::Draft),
        "published" => Ok(CommentStatus::Published),
        other => Err(LegacyError::InvalidColumn {
            column: "patch_comments.status",
            value: other.to_string(),
        }),
    }
}

#[async_trait]
impl LegacyStore for SqliteLegacyStore {
    async fn all_changes(&self) -> Result<Vec<Change>, LegacyError> {
        self.with_conn(|conn| Self::query_changes(conn, "", [])).await
    }

    async fn changes(&self, ids: &[ChangeId]) -> Result<Vec<Change>, LegacyError> {
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                out.extend(Self::query_changes(conn, "WHERE change_id = ?1", params![id.0])?);
            }
            out.sort_by_key(|c| c.id);
            out.dedup_by_key(|c| c.id);
            Ok(out)
        })
        .await
    }

    async fn change(&self, id: ChangeId) -> Result<Option<Change>, LegacyError> {
        self.with_conn(move |conn| {
            Ok(Self::query_changes(conn, "WHERE change_id = ?1", params![id.0])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn change_ids_by_project(
        &self,
        project: &ProjectName,
    ) -> Result<Vec<ChangeId>, LegacyError> {
        let project = project.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT change_id FROM changes WHERE project = ?1 ORDER BY change_id")?;
            let rows = stmt.query_map(params![project.as_str()], |row| row.get::<_, u32>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(ChangeId(row?));
            }
            Ok(ids)
        })
        .await
    }

    async fn all_change_ids(&self) -> Result<Vec<ChangeId>, LegacyError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT change_id FROM changes ORDER BY change_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, u32>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(ChangeId(row?));
            }
            Ok(ids)
        })
        .await
    }

    async fn bundle(&self, id: ChangeId) -> Result<ChangeBundle, LegacyError> {
        self.with_conn(move |conn| {
            // One read transaction so the rows are mutually consistent.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let change = Self::query_changes(&tx, "WHERE change_id = ?1", params![id.0])?
                .into_iter()
                .next()
                .ok_or(LegacyError::NoSuchChange(id))?;
            let bundle = ChangeBundle {
                change,
                patch_sets: Self::query_patch_sets(&tx, id)?,
                approvals: Self::query_approvals(&tx, id)?,
                messages: Self::query_messages(&tx, id)?,
                comments: Self::query_comments(&tx, id)?,
            };
            tx.commit()?;
            Ok(bundle)
        })
        .await
    }

    async fn patch_sets(&self, id: ChangeId) -> Result<Vec<PatchSet>, LegacyError> {
        self.with_conn(move |conn| Self::query_patch_sets(conn, id)).await
    }

    async fn next_change_id(&self) -> Result<u32, LegacyError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let next: u32 =
                tx.query_row("SELECT next_id FROM change_id_sequence", [], |row| row.get(0))?;
            let after = next.checked_add(1).ok_or(LegacyError::SequenceExhausted(next))?;
            tx.execute("UPDATE change_id_sequence SET next_id = ?1", params![after])?;
            tx.commit()?;
            Ok(next)
        })
        .await
    }

    async fn compare_and_set_log_state(
        &self,
        id: ChangeId,
        expected: Option<&LogState>,
        new: Option<&LogState>,
    ) -> Result<bool, LegacyError> {
        let expected = expected.cloned();
        let encoded = new.map(serde_json::to_string).transpose()?;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let stored: Option<Option<String>> = tx
                .query_row(
                    "SELECT log_state FROM changes WHERE change_id = ?1",
                    params![id.0],
                    |row| row.get(0),
                )
                .optional()?;
            let stored = stored.ok_or(LegacyError::NoSuchChange(id))?;
            let current = stored
                .as_deref()
                .map(serde_json::from_str::<LogState>)
                .transpose()?;
            if current != expected {
                return Ok(false);
            }
            tx.execute(
                "UPDATE changes SET log_state = ?1 WHERE change_id = ?2",
                params![encoded, id.0],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }
}

/// Opens [`SqliteLegacyStore`] handles on a database file.
pub struct SqliteLegacySource {
    path: PathBuf,
}

impl SqliteLegacySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LegacySource for SqliteLegacySource {
    async fn open(&self) -> Result<Arc<dyn LegacyStore>, LegacyError> {
        let path = self.path.clone();
        let store = tokio::task::spawn_blocking(move || SqliteLegacyStore::open(path)).await??;
        Ok(Arc::new(store))
    }
}
