//! On-disk store layout.
//!
//! ```text
//! {data_dir}/{store_id}/
//!     {root_hash}.dat        root descriptor (JSON)
//!     manifest.dat           newline-delimited root hashes
//!     height.json            chain height pointer
//!     data/<2-hex>/<rest>    content-addressed data files
//! ```
//!
//! All writes land in a sibling temp file first and are renamed into place
//! once complete, so readers never observe a partial file.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const MANIFEST_FILE: &str = "manifest.dat";
pub const HEIGHT_FILE: &str = "height.json";
pub const DATA_DIR: &str = "data";
const TEMP_SUFFIX: &str = ".tmp";

/// Per-file entry of a root descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub sha256: String,
    /// Fields this crate does not interpret, kept for round-tripping.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl FileEntry {
    pub fn new(sha256: impl Into<String>) -> Self {
        Self {
            sha256: sha256.into(),
            extra: Map::new(),
        }
    }
}

/// File set of one generation, persisted as `{root_hash}.dat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootDescriptor {
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RootDescriptor {
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|err| SyncError::parse("root descriptor", err))
    }

    /// Distinct data-file hashes referenced by this descriptor.
    pub fn data_hashes(&self) -> BTreeSet<&str> {
        self.files.values().map(|entry| entry.sha256.as_str()).collect()
    }
}

/// Chain height observed before a root walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightPointer {
    pub height: u64,
    pub hash: String,
}

/// Fan-out path `data/<2-hex>/<rest>` for a data file.
pub fn data_file_relative_path(sha256: &str) -> Result<String> {
    if sha256.len() <= 2 || !sha256.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(SyncError::parse(
            "data file hash",
            format!("{sha256:?} is not a hex digest"),
        ));
    }
    let (prefix, rest) = sha256.split_at(2);
    Ok(format!("{DATA_DIR}/{prefix}/{rest}"))
}

pub fn parse_manifest(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn render_manifest(roots: &[String]) -> String {
    let mut out = roots.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Write `bytes` to `path` through a sibling temp file and rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_path(path);
    let written = async {
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err.into());
    }
    tokio::fs::rename(&temp, path).await?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Local directory of one store.
#[derive(Debug, Clone)]
pub struct StoreDirectory {
    root: PathBuf,
}

impl StoreDirectory {
    pub fn new(data_dir: &Path, store_id: &str) -> Self {
        Self {
            root: data_dir.join(store_id),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn root_descriptor_path(&self, root_hash: &str) -> PathBuf {
        self.root.join(format!("{root_hash}.dat"))
    }

    pub fn has_root(&self, root_hash: &str) -> bool {
        self.root_descriptor_path(root_hash).is_file()
    }

    pub fn data_file_path(&self, sha256: &str) -> Result<PathBuf> {
        Ok(self.root.join(data_file_relative_path(sha256)?))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn height_path(&self) -> PathBuf {
        self.root.join(HEIGHT_FILE)
    }

    pub async fn read_root_descriptor(&self, root_hash: &str) -> Result<RootDescriptor> {
        let bytes = tokio::fs::read(self.root_descriptor_path(root_hash)).await?;
        RootDescriptor::from_slice(&bytes)
            .map_err(|err| SyncError::parse(format!("root descriptor {root_hash}"), err))
    }

    pub async fn write_root_descriptor(
        &self,
        root_hash: &str,
        descriptor: &RootDescriptor,
    ) -> Result<()> {
        self.write_root_descriptor_bytes(root_hash, &descriptor.to_vec()?)
            .await
    }

    pub async fn write_root_descriptor_bytes(&self, root_hash: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.root_descriptor_path(root_hash), bytes).await
    }

    /// Local manifest entries; missing manifest is empty.
    pub async fn read_manifest(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(self.manifest_path()).await {
            Ok(text) => Ok(parse_manifest(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write_manifest(&self, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.manifest_path(), bytes).await
    }

    pub async fn read_height(&self) -> Result<Option<HeightPointer>> {
        match tokio::fs::read(self.height_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| SyncError::parse(HEIGHT_FILE, err)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write_height(&self, pointer: &HeightPointer) -> Result<()> {
        let bytes = serde_json::to_vec(pointer).map_err(|err| SyncError::parse(HEIGHT_FILE, err))?;
        write_atomic(&self.height_path(), &bytes).await
    }

    /// Remove a data file; a missing file is not an error.
    pub async fn remove_data_file(&self, sha256: &str) -> Result<()> {
        match tokio::fs::remove_file(self.data_file_path(sha256)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
