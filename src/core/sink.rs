use crate::core::error::FailureKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Logical output location: `<root>/<folder>/<display_name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    root: PathBuf,
    relative_path: String,
    display_name: String,
}

pub struct OpenedSink {
    pub writer: SinkWriter,
    /// True only when appending to a non-empty existing file.
    pub resume: bool,
    pub existing_len: u64,
}

impl OutputTarget {
    pub fn new(root: &Path, folder: Option<&str>, stem: &str, extension: &str) -> Self {
        let relative_path = folder
            .map(|f| {
                f.split(['/', '\\'])
                    .map(sanitize_filename::sanitize)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default();
        Self {
            root: root.to_path_buf(),
            relative_path,
            display_name: format!("{}.{}", stem, extension),
        }
    }

    pub fn from_parts(root: &Path, relative_path: &str, display_name: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            relative_path: relative_path.to_string(),
            display_name: display_name.to_string(),
        }
    }

    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn extension(&self) -> Option<&str> {
        Path::new(&self.display_name).extension().and_then(|e| e.to_str())
    }

    pub fn path(&self) -> PathBuf {
        let mut p = self.root.clone();
        if !self.relative_path.is_empty() {
            p.push(&self.relative_path);
        }
        p.push(&self.display_name);
        p
    }

    pub async fn existing_len(&self) -> Option<u64> {
        tokio::fs::metadata(self.path()).await.ok().map(|m| m.len())
    }

    /// Opens for append when resuming onto existing bytes, otherwise
    /// recreates the file empty. Storage errors surface before any network
    /// activity.
    pub async fn open(&self, try_resume: bool) -> Result<OpenedSink, FailureKind> {
        let path = self.path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|_| FailureKind::StorageUnavailable)?;
        }

        let existing = self.existing_len().await;
        let existing_len = match existing {
            Some(len) if try_resume => len,
            _ => 0,
        };
        let resume = existing_len > 0;

        let file: File = if resume {
            OpenOptions::new()
                .append(true)
                .open(&path)
                .await
                .map_err(|_| FailureKind::OpenFile)?
        } else {
            File::create(&path).await.map_err(|_| FailureKind::CreateFile)?
        };

        Ok(OpenedSink {
            writer: SinkWriter { file: BufWriter::with_capacity(256 * 1024, file) },
            resume,
            existing_len,
        })
    }

    /// Ok(true) when a file was removed, Ok(false) when there was none.
    pub async fn delete(&self) -> std::io::Result<bool> {
        match tokio::fs::remove_file(self.path()).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

pub struct SinkWriter {
    file: BufWriter<File>,
}

impl SinkWriter {
    pub async fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.file.write_all(data).await
    }

    /// Pushes buffered bytes to disk. Must run before persisting any
    /// progress record that counts those bytes.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.get_mut().sync_data().await
    }

    pub async fn finish(mut self) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.get_mut().sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_open_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = OutputTarget::new(dir.path(), Some("Show"), "Episode 1", "mp4");
        tokio::fs::create_dir_all(target.path().parent().unwrap()).await.unwrap();
        tokio::fs::write(target.path(), b"stale").await.unwrap();

        let opened = target.open(false).await.unwrap();
        assert!(!opened.resume);
        assert_eq!(opened.existing_len, 0);
        opened.writer.finish().await.unwrap();
        assert_eq!(tokio::fs::read(target.path()).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn resume_appends_after_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let target = OutputTarget::new(dir.path(), None, "movie", "mp4");
        tokio::fs::write(target.path(), b"abc").await.unwrap();

        let mut opened = target.open(true).await.unwrap();
        assert!(opened.resume);
        assert_eq!(opened.existing_len, 3);
        opened.writer.append(b"def").await.unwrap();
        opened.writer.finish().await.unwrap();
        assert_eq!(tokio::fs::read(target.path()).await.unwrap(), b"abcdef");
    }

    #[tokio::test]
    async fn flush_lands_buffered_bytes_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let target = OutputTarget::new(dir.path(), None, "seg", "mp4");
        let mut opened = target.open(false).await.unwrap();

        opened.writer.append(&[7u8; 1000]).await.unwrap();
        opened.writer.flush().await.unwrap();
        assert_eq!(target.existing_len().await, Some(1000));

        opened.writer.append(&[8u8; 10]).await.unwrap();
        opened.writer.finish().await.unwrap();
        assert_eq!(target.existing_len().await, Some(1010));
    }

    #[tokio::test]
    async fn resume_without_file_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let target = OutputTarget::new(dir.path(), Some("a/b"), "x", "mp4");
        let opened = target.open(true).await.unwrap();
        assert!(!opened.resume);
        assert!(target.path().ends_with("a/b/x.mp4"));
        assert!(target.delete().await.unwrap());
        assert!(!target.delete().await.unwrap());
    }
}
