//! Local object store for converted bundles
//!
//! A thin hierarchy of named directories under one root, with per-file
//! atomicity: writers stream into a `.tmp` sibling and rename into place on
//! close, so a crash mid-write never leaves a half-visible object.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::utils::error::{AccelError, Result};

fn storage_err(op: &str, path: &Path, e: std::io::Error) -> AccelError {
    AccelError::Storage(format!("{} {}: {}", op, path.display(), e))
}

/// Store rooted at a single directory
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| storage_err("create store root", &root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Handle to a (possibly not yet created) named subdirectory
    pub fn dir(&self, name: &str) -> ObjectDir {
        ObjectDir {
            path: self.root.join(name),
        }
    }
}

/// One directory inside the store
#[derive(Debug, Clone)]
pub struct ObjectDir {
    path: PathBuf,
}

impl ObjectDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn subdir(&self, name: &str) -> ObjectDir {
        ObjectDir {
            path: self.path.join(name),
        }
    }

    pub async fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.path)
            .await
            .map_err(|e| storage_err("create dir", &self.path, e))
    }

    pub async fn exists(&self) -> bool {
        fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn has_file(&self, name: &str) -> bool {
        fs::try_exists(self.file_path(name)).await.unwrap_or(false)
    }

    /// Open a streaming writer; the object appears only after `close`
    pub async fn create_file(&self, name: &str) -> Result<ObjectWriter> {
        self.ensure().await?;
        let final_path = self.file_path(name);
        let tmp_path = self.file_path(&format!("{}.tmp", name));
        let file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| storage_err("create file", &tmp_path, e))?;
        Ok(ObjectWriter {
            file,
            tmp_path,
            final_path,
            bytes_written: 0,
        })
    }

    /// Write a whole object in one call (temp + rename underneath)
    pub async fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut writer = self.create_file(name).await?;
        writer.write(bytes).await?;
        writer.close().await
    }

    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.file_path(name);
        fs::read(&path)
            .await
            .map_err(|e| storage_err("read file", &path, e))
    }

    /// Read `start..end` of an object without loading the rest
    pub async fn read_slice(&self, name: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        if start > end {
            return Err(AccelError::Storage(format!(
                "invalid slice {}..{} of {}",
                start, end, name
            )));
        }
        let path = self.file_path(name);
        let mut file = fs::File::open(&path)
            .await
            .map_err(|e| storage_err("open file", &path, e))?;
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| storage_err("seek", &path, e))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| storage_err("read slice", &path, e))?;
        Ok(buf)
    }

    pub async fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name);
        fs::remove_file(&path)
            .await
            .map_err(|e| storage_err("delete file", &path, e))
    }

    /// Entry names (files and subdirectories), sorted
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.path)
            .await
            .map_err(|e| storage_err("list dir", &self.path, e))?;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| storage_err("list dir", &self.path, e))?
        {
            entries.push(entry.file_name().to_string_lossy().to_string());
        }
        entries.sort();
        Ok(entries)
    }

    /// Remove this directory and everything under it
    pub async fn remove(&self) -> Result<()> {
        if !self.exists().await {
            return Ok(());
        }
        debug!("removing store subtree {}", self.path.display());
        fs::remove_dir_all(&self.path)
            .await
            .map_err(|e| storage_err("remove subtree", &self.path, e))
    }
}

/// Streaming writer with rename-on-close atomicity
pub struct ObjectWriter {
    file: fs::File,
    tmp_path: PathBuf,
    final_path: PathBuf,
    bytes_written: u64,
}

impl ObjectWriter {
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| storage_err("write", &self.tmp_path, e))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flush and publish the object under its final name
    pub async fn close(mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| storage_err("flush", &self.tmp_path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| storage_err("sync", &self.tmp_path, e))?;
        drop(self.file);
        fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(|e| storage_err("publish", &self.final_path, e))
    }

    /// Discard the partial object
    pub async fn abort(self) -> Result<()> {
        drop(self.file);
        fs::remove_file(&self.tmp_path)
            .await
            .map_err(|e| storage_err("abort", &self.tmp_path, e))
    }
}
