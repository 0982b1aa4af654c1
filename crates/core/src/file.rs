//! File records, their lineage, and the outcomes of upload and delete.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Store-assigned identifier of a file record.
///
/// The id of an original record is also the key of its blob object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(i64);

impl FileId {
    /// Wrap a raw database id.
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw database id.
    pub fn get(&self) -> i64 {
        self.0
    }

    /// Blob store key for content owned by this original.
    pub fn blob_key(&self) -> String {
        self.0.to_string()
    }
}

impl From<i64> for FileId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for FileId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a file record. Only regular files exist today.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    #[default]
    #[serde(rename = "FILE")]
    Regular,
}

impl FileKind {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "FILE",
        }
    }
}

impl FromStr for FileKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "FILE" => Ok(Self::Regular),
            other => Err(crate::Error::InvalidFileKind(other.to_string())),
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an upload was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    /// The user already held a record for this content; nothing changed.
    AlreadyUploaded,
    /// Content existed under another record; a reference was created.
    Reference,
    /// New content; a blob was written and an original record created.
    Stored,
}

/// Result of a successful upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    pub file_id: FileId,
    pub kind: UploadKind,
}

impl UploadOutcome {
    /// Whether this upload created a new record.
    pub fn created(&self) -> bool {
        !matches!(self.kind, UploadKind::AlreadyUploaded)
    }
}

/// Result of a successful delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// A reference record was removed; the shared content is untouched.
    ReferenceRemoved,
    /// The original record was removed but references still need the content.
    RecordRemoved { remaining_references: u64 },
    /// The last record for the content was removed along with its blob.
    ContentRemoved,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_blob_key() {
        let id = FileId::new(42);
        assert_eq!(id.blob_key(), "42");
        assert_eq!(" 42 ".parse::<FileId>().unwrap(), id);
        assert!("abc".parse::<FileId>().is_err());
    }

    #[test]
    fn test_file_kind_db_representation() {
        assert_eq!(FileKind::Regular.as_str(), "FILE");
        assert_eq!("FILE".parse::<FileKind>().unwrap(), FileKind::Regular);
        assert!("DIR".parse::<FileKind>().is_err());
    }

    #[test]
    fn test_upload_outcome_created() {
        let existing = UploadOutcome {
            file_id: FileId::new(1),
            kind: UploadKind::AlreadyUploaded,
        };
        let reference = UploadOutcome {
            file_id: FileId::new(2),
            kind: UploadKind::Reference,
        };
        assert!(!existing.created());
        assert!(reference.created());
    }

    #[test]
    fn test_delete_outcome_serializes_tagged() {
        let json = serde_json::to_value(DeleteOutcome::RecordRemoved {
            remaining_references: 3,
        })
        .unwrap();
        assert_eq!(json["outcome"], "record_removed");
        assert_eq!(json["remaining_references"], 3);
    }
}
