//! On-disk layout for uploaded files.
//!
//! `<root>/client_files/<client name>_files/<file name>`
//!
//! Every path handed out here is checked to stay under the client's
//! directory. Callers hold the filesystem lock around multi-step sequences.

use crate::error::{Result, TransferError};
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};

const FILES_DIR: &str = "client_files";

/// Reduce a client-supplied file name to its last path component.
///
/// Both `/` and `\` count as separators. Nothing usable left is an error.
pub fn sanitize_file_name(raw: &str) -> Result<String> {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('\0');
    match base {
        "" | "." | ".." => Err(TransferError::protocol(format!(
            "file name {:?} has no usable component",
            raw
        ))),
        name => Ok(name.to_string()),
    }
}

/// Check that a client name can be used as a directory name as-is.
pub fn validate_client_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TransferError::protocol("Empty client name not allowed"));
    }
    if name.contains(['/', '\\', '\0']) || name == "." || name == ".." {
        return Err(TransferError::protocol(format!(
            "Client name not allowed: {:?}",
            name
        )));
    }
    Ok(())
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// The filesystem side of the server.
#[derive(Debug, Clone)]
pub struct ClientFiles {
    root: PathBuf,
}

impl ClientFiles {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join(FILES_DIR),
        }
    }

    pub fn client_dir(&self, client_name: &str) -> Result<PathBuf> {
        validate_client_name(client_name)?;
        Ok(self.root.join(format!("{}_files", client_name)))
    }

    /// Destination path for a (sanitized) file name.
    pub fn file_path(&self, client_name: &str, file_name: &str) -> Result<PathBuf> {
        let dir = self.client_dir(client_name)?;
        let file_name = sanitize_file_name(file_name)?;
        let full = dir.join(&file_name);

        if !normalize_path(&full).starts_with(normalize_path(&dir)) {
            return Err(TransferError::protocol(format!(
                "Path escapes client directory: {}",
                file_name
            )));
        }
        Ok(full)
    }

    /// Create the parent directory and a fresh, truncated file for writing.
    pub async fn create(&self, path: &Path) -> Result<File> {
        self.check_owned(path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(file)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.check_owned(path)?;
        Ok(fs::read(path).await?)
    }

    pub async fn overwrite(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.check_owned(path)?;
        fs::write(path, contents).await?;
        Ok(())
    }

    /// Remove a file. A file that is already gone is not an error.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        self.check_owned(path)?;
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("File {} was already gone", path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn check_owned(&self, path: &Path) -> Result<()> {
        if !normalize_path(path).starts_with(normalize_path(&self.root)) {
            return Err(TransferError::protocol(format!(
                "Path outside storage root: {}",
                path.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("report.txt").unwrap(), "report.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\notes.md").unwrap(), "notes.md");
        assert_eq!(sanitize_file_name("/abs/path/a.bin").unwrap(), "a.bin");
    }

    #[test]
    fn test_sanitize_rejects_empty_components() {
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("dir/").is_err());
        assert!(sanitize_file_name("a/..").is_err());
    }

    #[test]
    fn test_client_name_validation() {
        assert!(validate_client_name("alice").is_ok());
        assert!(validate_client_name("Alice Smith").is_ok());
        assert!(validate_client_name("").is_err());
        assert!(validate_client_name("../bob").is_err());
        assert!(validate_client_name("..").is_err());
        assert!(validate_client_name("a\\b").is_err());
    }

    #[test]
    fn test_layout() {
        let files = ClientFiles::new("/srv/data");
        assert_eq!(
            files.file_path("alice", "../report.txt").unwrap(),
            PathBuf::from("/srv/data/client_files/alice_files/report.txt")
        );
    }

    #[tokio::test]
    async fn test_create_write_read_remove() {
        let tmp = TempDir::new().unwrap();
        let files = ClientFiles::new(tmp.path());
        let path = files.file_path("alice", "a.bin").unwrap();

        let mut file = files.create(&path).await.unwrap();
        file.write_all(b"hello").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(files.read(&path).await.unwrap(), b"hello");
        files.overwrite(&path, b"bye").await.unwrap();
        assert_eq!(files.read(&path).await.unwrap(), b"bye");

        files.remove(&path).await.unwrap();
        assert!(!path.exists());
        // second remove is fine
        files.remove(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_refuses_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let files = ClientFiles::new(tmp.path());
        let outside = tmp.path().join("elsewhere.txt");
        assert!(files.create(&outside).await.is_err());
        assert!(files.remove(&outside).await.is_err());
    }
}
