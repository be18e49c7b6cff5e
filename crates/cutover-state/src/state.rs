//! Migration states and the config flags that encode them.

use std::fmt;
use std::str::FromStr;

use cutover_legacy::PrimaryStorage;

use crate::StateStoreError;

/// Stage of the migration from the legacy store to the log store.
///
/// States are totally ordered; a migration only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MigrationState {
    /// Only the legacy store is used.
    Legacy,
    /// Writes go to both stores; reads come from the legacy store.
    Write,
    /// The log store is readable and writable; ids still come from the legacy sequence.
    ReadWriteNoSequence,
    /// Ids come from the log-store sequence; the legacy store is primary.
    ReadWriteWithSequenceLegacyPrimary,
    /// New changes are log-primary; existing changes are being cut over.
    ReadWriteWithSequenceLogPrimary,
    /// Every change is log-primary and the legacy store is disabled.
    LogPrimary,
}

/// The `[log_db.changes]` flags describing a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateFlags {
    pub read: bool,
    pub write: bool,
    pub sequence: bool,
    pub primary_storage: PrimaryStorage,
    pub disable_legacy: bool,
}

impl fmt::Display for StateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "read={} write={} sequence={} primary_storage={} disable_legacy={}",
            self.read,
            self.write,
            self.sequence,
            primary_storage_as_str(self.primary_storage),
            self.disable_legacy
        )
    }
}

pub(crate) fn primary_storage_as_str(primary: PrimaryStorage) -> &'static str {
    match primary {
        PrimaryStorage::Legacy => "legacy",
        PrimaryStorage::Log => "log",
    }
}

pub(crate) fn parse_primary_storage(value: &str) -> Option<PrimaryStorage> {
    match value.to_ascii_lowercase().as_str() {
        "legacy" => Some(PrimaryStorage::Legacy),
        "log" => Some(PrimaryStorage::Log),
        _ => None,
    }
}

impl MigrationState {
    /// Every state, in order.
    pub const ALL: [MigrationState; 6] = [
        MigrationState::Legacy,
        MigrationState::Write,
        MigrationState::ReadWriteNoSequence,
        MigrationState::ReadWriteWithSequenceLegacyPrimary,
        MigrationState::ReadWriteWithSequenceLogPrimary,
        MigrationState::LogPrimary,
    ];

    pub fn flags(self) -> StateFlags {
        use MigrationState::*;
        let (read, write, sequence, primary_storage, disable_legacy) = match self {
            Legacy => (false, false, false, PrimaryStorage::Legacy, false),
            Write => (false, true, false, PrimaryStorage::Legacy, false),
            ReadWriteNoSequence => (true, true, false, PrimaryStorage::Legacy, false),
            ReadWriteWithSequenceLegacyPrimary => (true, true, true, PrimaryStorage::Legacy, false),
            ReadWriteWithSequenceLogPrimary => (true, true, true, PrimaryStorage::Log, false),
            LogPrimary => (true, true, true, PrimaryStorage::Log, true),
        };
        StateFlags {
            read,
            write,
            sequence,
            primary_storage,
            disable_legacy,
        }
    }

    /// The state whose flags are exactly `flags`, if any.
    pub fn from_flags(flags: &StateFlags) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.flags() == *flags)
    }

    /// Changes are written to the log store.
    pub fn write(self) -> bool {
        self.flags().write
    }

    /// Changes may be read from the log store.
    pub fn read(self) -> bool {
        self.flags().read
    }

    /// Change ids come from the log-store sequence.
    pub fn sequence(self) -> bool {
        self.flags().sequence
    }

    /// Which store new changes are primary in.
    pub fn primary_storage(self) -> PrimaryStorage {
        self.flags().primary_storage
    }

    pub fn disable_legacy(self) -> bool {
        self.flags().disable_legacy
    }

    /// The following state, if any.
    pub fn next(self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Legacy => "LEGACY",
            MigrationState::Write => "WRITE",
            MigrationState::ReadWriteNoSequence => "READ_WRITE_NO_SEQUENCE",
            MigrationState::ReadWriteWithSequenceLegacyPrimary => {
                "READ_WRITE_WITH_SEQUENCE_LEGACY_PRIMARY"
            }
            MigrationState::ReadWriteWithSequenceLogPrimary => {
                "READ_WRITE_WITH_SEQUENCE_LOG_PRIMARY"
            }
            MigrationState::LogPrimary => "LOG_PRIMARY",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = StateStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| StateStoreError::Unparseable(s.to_string()))
    }
}
