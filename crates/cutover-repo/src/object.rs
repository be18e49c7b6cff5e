//! Content-addressed objects.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::RepoError;

/// Length of an object id in bytes.
const ID_LEN: usize = 32;

/// Identifier of an object: the SHA-256 of its kind tag and contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; ID_LEN]);

impl ObjectId {
    /// The all-zero id, used for "ref does not exist" in commands.
    pub const ZERO: ObjectId = ObjectId([0; ID_LEN]);

    /// Whether this is the zero id.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Raw bytes of the id.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Convert an optional ref value into a command value.
    pub fn or_zero(id: Option<ObjectId>) -> ObjectId {
        id.unwrap_or(Self::ZERO)
    }

    /// Convert a command value into an optional ref value.
    pub fn non_zero(self) -> Option<ObjectId> {
        (!self.is_zero()).then_some(self)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ID_LEN * 2 || !s.is_ascii() {
            return Err(RepoError::InvalidObjectId(s.to_string()));
        }
        let mut bytes = [0u8; ID_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| RepoError::InvalidObjectId(s.to_string()))?;
        }
        Ok(ObjectId(bytes))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Commit,
}

impl ObjectKind {
    /// Single-byte tag used in hashing and on-disk encoding.
    pub(crate) fn tag(self) -> u8 {
        match self {
            ObjectKind::Blob => b'b',
            ObjectKind::Commit => b'c',
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'b' => Some(ObjectKind::Blob),
            b'c' => Some(ObjectKind::Commit),
            _ => None,
        }
    }
}

/// An object's kind and contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub kind: ObjectKind,
    pub data: Vec<u8>,
}

impl RawObject {
    /// Create a blob object.
    pub fn blob(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: ObjectKind::Blob,
            data: data.into(),
        }
    }

    /// Compute the id of this object.
    pub fn id(&self) -> ObjectId {
        let mut hasher = Sha256::new();
        hasher.update([self.kind.tag()]);
        hasher.update((self.data.len() as u64).to_be_bytes());
        hasher.update(&self.data);
        ObjectId(hasher.finalize().into())
    }

    /// Encode as tag byte followed by contents.
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 1);
        out.push(self.kind.tag());
        out.extend_from_slice(&self.data);
        out
    }

    pub(crate) fn decode(id: &ObjectId, bytes: &[u8]) -> Result<Self, RepoError> {
        let (tag, data) = bytes.split_first().ok_or_else(|| RepoError::CorruptObject {
            id: id.to_string(),
            reason: "empty object".to_string(),
        })?;
        let kind = ObjectKind::from_tag(*tag).ok_or_else(|| RepoError::CorruptObject {
            id: id.to_string(),
            reason: format!("unknown kind tag {}", tag),
        })?;
        Ok(Self {
            kind,
            data: data.to_vec(),
        })
    }
}

/// A commit: a message and author stamp pointing at zero or more parents.
///
/// Serialization is deterministic, so the same logical commit always hashes
/// to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub parents: Vec<ObjectId>,
    pub author: String,
    pub when: DateTime<Utc>,
    pub message: String,
}

impl Commit {
    /// Encode into a commit object.
    pub fn to_object(&self) -> Result<RawObject, RepoError> {
        Ok(RawObject {
            kind: ObjectKind::Commit,
            data: serde_json::to_vec(self)?,
        })
    }

    /// Decode a commit object.
    pub fn parse(id: &ObjectId, raw: &RawObject) -> Result<Self, RepoError> {
        if raw.kind != ObjectKind::Commit {
            return Err(RepoError::CorruptObject {
                id: id.to_string(),
                reason: "not a commit".to_string(),
            });
        }
        Ok(serde_json::from_slice(&raw.data)?)
    }
}
