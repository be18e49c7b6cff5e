//! Layered TOML configuration.
//!
//! A base file is overridden key by key by an overlay file. Only the overlay
//! is ever written.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use cutover_legacy::PrimaryStorage;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use toml::{Table, Value};

use crate::state::{parse_primary_storage, primary_storage_as_str};
use crate::{MigrationState, StateFlags, StateStoreError};

/// Table holding the migration keys.
pub const SECTION: [&str; 2] = ["log_db", "changes"];

pub(crate) const KEY_READ: &str = "read";
pub(crate) const KEY_WRITE: &str = "write";
pub(crate) const KEY_SEQUENCE: &str = "sequence";
pub(crate) const KEY_PRIMARY_STORAGE: &str = "primary_storage";
pub(crate) const KEY_DISABLE_LEGACY: &str = "disable_legacy";
pub(crate) const KEY_AUTO_MIGRATE: &str = "auto_migrate";
pub(crate) const KEY_TRIAL: &str = "trial";
pub(crate) const KEY_INITIAL_SEQUENCE_GAP: &str = "initial_sequence_gap";

/// The merged view of a base file and an overlay file.
#[derive(Debug, Clone, Default)]
pub struct LayeredConfig {
    base: Table,
    overlay: Table,
}

impl LayeredConfig {
    pub fn new(base: Table, overlay: Table) -> Self {
        Self { base, overlay }
    }

    /// Read both files. A missing file is an empty layer.
    pub async fn load(base_path: &Path, overlay_path: &Path) -> Result<Self, StateStoreError> {
        Ok(Self {
            base: read_table(base_path).await?,
            overlay: read_table(overlay_path).await?,
        })
    }

    /// Value of a `[log_db.changes]` key, overlay first.
    pub fn get(&self, key: &str) -> Option<&Value> {
        section(&self.overlay)
            .and_then(|t| t.get(key))
            .or_else(|| section(&self.base).and_then(|t| t.get(key)))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, StateStoreError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Boolean(b)) => Ok(*b),
            Some(other) => Err(invalid(key, "a boolean", other)),
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> Result<i64, StateStoreError> {
        match self.get(key) {
            None => Ok(default),
            Some(Value::Integer(i)) => Ok(*i),
            Some(other) => Err(invalid(key, "an integer", other)),
        }
    }

    pub fn primary_storage(&self) -> Result<PrimaryStorage, StateStoreError> {
        match self.get(KEY_PRIMARY_STORAGE) {
            None => Ok(PrimaryStorage::Legacy),
            Some(value @ Value::String(s)) => parse_primary_storage(s)
                .ok_or_else(|| invalid(KEY_PRIMARY_STORAGE, "\"legacy\" or \"log\"", value)),
            Some(other) => Err(invalid(KEY_PRIMARY_STORAGE, "a string", other)),
        }
    }

    /// The state flags as configured.
    pub fn flags(&self) -> Result<StateFlags, StateStoreError> {
        Ok(StateFlags {
            read: self.get_bool(KEY_READ, false)?,
            write: self.get_bool(KEY_WRITE, false)?,
            sequence: self.get_bool(KEY_SEQUENCE, false)?,
            primary_storage: self.primary_storage()?,
            disable_legacy: self.get_bool(KEY_DISABLE_LEGACY, false)?,
        })
    }

    /// The configured migration state.
    ///
    /// Fails with [`StateStoreError::Unparseable`] when the flags match no state.
    pub fn state(&self) -> Result<MigrationState, StateStoreError> {
        let flags = self.flags()?;
        MigrationState::from_flags(&flags)
            .ok_or_else(|| StateStoreError::Unparseable(flags.to_string()))
    }

    pub fn overlay(&self) -> &Table {
        &self.overlay
    }

    /// Edit the overlay's `[log_db.changes]` table.
    pub fn edit<F>(&mut self, f: F)
    where
        F: FnOnce(&mut ConfigEdit),
    {
        let [outer, inner] = SECTION;
        let mut parent = take_table(&mut self.overlay, outer);
        let mut edit = ConfigEdit {
            section: take_table(&mut parent, inner),
        };
        f(&mut edit);
        parent.insert(inner.to_string(), Value::Table(edit.section));
        self.overlay.insert(outer.to_string(), Value::Table(parent));
    }

    /// Atomically replace `path` with the overlay layer.
    pub async fn write_overlay(&self, path: &Path) -> Result<(), StateStoreError> {
        static NEXT_TMP: AtomicU64 = AtomicU64::new(0);
        let text = toml::to_string_pretty(&self.overlay)?;
        fs::create_dir_all(parent_dir(path)).await?;
        let n = NEXT_TMP.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp{}-{}", std::process::id(), n));
        let mut file = fs::File::create(&tmp).await?;
        let written = async {
            file.write_all(text.as_bytes()).await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Mutations of the overlay's `[log_db.changes]` table.
#[derive(Debug, Default)]
pub struct ConfigEdit {
    section: Table,
}

impl ConfigEdit {
    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.section.insert(key.to_string(), Value::Boolean(value));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.section.insert(key.to_string(), Value::Integer(value));
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.section
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn unset(&mut self, key: &str) {
        self.section.remove(key);
    }

    pub fn set_auto_migrate(&mut self, auto_migrate: bool) {
        self.set_bool(KEY_AUTO_MIGRATE, auto_migrate);
    }

    pub fn set_trial(&mut self, trial: bool) {
        self.set_bool(KEY_TRIAL, trial);
    }

    /// Write every flag of `state`.
    pub fn set_state(&mut self, state: MigrationState) {
        let flags = state.flags();
        self.set_bool(KEY_READ, flags.read);
        self.set_bool(KEY_WRITE, flags.write);
        self.set_bool(KEY_SEQUENCE, flags.sequence);
        self.set_str(KEY_PRIMARY_STORAGE, primary_storage_as_str(flags.primary_storage));
        self.set_bool(KEY_DISABLE_LEGACY, flags.disable_legacy);
    }
}

/// Remove a child table, or an empty one if absent or not a table.
fn take_table(parent: &mut Table, name: &str) -> Table {
    match parent.remove(name) {
        Some(Value::Table(t)) => t,
        _ => Table::new(),
    }
}

fn section(table: &Table) -> Option<&Table> {
    let mut current = table;
    for name in SECTION {
        current = current.get(name)?.as_table()?;
    }
    Some(current)
}

async fn read_table(path: &Path) -> Result<Table, StateStoreError> {
    match fs::read_to_string(path).await {
        Ok(text) => text.parse::<Table>().map_err(|source| StateStoreError::Parse {
            path: path.to_path_buf(),
            source,
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Table::new()),
        Err(e) => Err(e.into()),
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn invalid(key: &str, expected: &'static str, found: &Value) -> StateStoreError {
    StateStoreError::InvalidValue {
        key: format!("{}.{}", SECTION.join("."), key),
        expected,
        found: found.to_string(),
    }
}
