//! Persistence is organized through [day_store::DayPartitionedStore].
//! The basic idea is:
//!  - There is a directory with one encrypted file per UTC day, named by the
//!    day the contained activities started.
//!  - A partition's decrypted payload maps activity id to the serialized
//!    [activity::Activity].
//!  - Every rewrite goes through a temp file, a read-back verification and an
//!    atomic rename, so a crash can't leave a half-written partition behind.

pub mod activity;
pub mod cipher;
pub mod day_store;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io failure")]
    Io(#[from] std::io::Error),
    #[error("activity serialization failure")]
    Serialize(#[from] serde_json::Error),
    #[error("encryption failure")]
    Encrypt,
    #[error("decryption failure")]
    Decrypt,
    #[error("written partition {0:?} did not read back identically")]
    VerificationFailed(PathBuf),
}
