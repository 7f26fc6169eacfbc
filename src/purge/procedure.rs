//! Deletion procedure loading.
//!
//! The procedure is an opaque, pre-reviewed SQL script that reads the staging
//! relation and deletes every dependent and primary row for the staged
//! identifiers. It is never parsed or rewritten here; only its digest is
//! recorded so a report names exactly which script ran.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcedureError {
    #[error("failed to read deletion procedure '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("deletion procedure '{}' is empty", path.display())]
    Empty { path: PathBuf },
}

/// A loaded deletion script and its SHA-256 digest.
#[derive(Debug, Clone)]
pub struct DeletionProcedure {
    path: PathBuf,
    sql: String,
    sha256: String,
}

impl DeletionProcedure {
    /// Read a deletion script from disk.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ProcedureError> {
        let path = path.as_ref();
        let sql = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ProcedureError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_script(path, sql)
    }

    /// Wrap a script that is already in memory.
    pub fn from_script(
        path: impl Into<PathBuf>,
        sql: impl Into<String>,
    ) -> Result<Self, ProcedureError> {
        let path = path.into();
        let sql = sql.into();
        if sql.trim().is_empty() {
            return Err(ProcedureError::Empty { path });
        }
        let sha256 = hex::encode(Sha256::digest(sql.as_bytes()));
        Ok(Self { path, sql, sha256 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Lowercase hex SHA-256 of the script bytes.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_digest_is_stable() {
        let a = DeletionProcedure::from_script("a.sql", "DELETE FROM users;").unwrap();
        let b = DeletionProcedure::from_script("b.sql", "DELETE FROM users;").unwrap();
        let c = DeletionProcedure::from_script("a.sql", "DELETE FROM events;").unwrap();

        assert_eq!(a.sha256(), b.sha256());
        assert_ne!(a.sha256(), c.sha256());
        assert_eq!(a.sha256().len(), 64);
    }

    #[test]
    fn test_known_digest() {
        let procedure = DeletionProcedure::from_script("p.sql", "abc").unwrap();
        assert_eq!(
            procedure.sha256(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_blank_script_rejected() {
        let err = DeletionProcedure::from_script("blank.sql", "  \n\t ").unwrap_err();
        assert!(matches!(err, ProcedureError::Empty { .. }));
        assert!(err.to_string().contains("blank.sql"));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "DELETE FROM users WHERE id IN (SELECT identifier FROM erasure_targets);")
            .unwrap();

        let procedure = DeletionProcedure::load(file.path()).await.unwrap();
        assert!(procedure.sql().starts_with("DELETE FROM users"));
        assert_eq!(procedure.path(), file.path());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.sql");

        let err = DeletionProcedure::load(&missing).await.unwrap_err();
        assert!(matches!(err, ProcedureError::Io { .. }));
    }
}
