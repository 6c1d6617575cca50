//! Session output directories and content-addressed publication.
//!
//! An encode writes into `<root>/sessions/<container>_<provider>_<session>`.
//! Once it completes, the directory is hashed and moved to
//! `<root>/content/<sha256>`. Readers must accept either location until the
//! move has happened; [`OutputLayout::resolve_session_dir`] does that.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use pf_core::{normalize_container, Error, Result, SessionId};

const SESSIONS_DIR: &str = "sessions";
const CONTENT_DIR: &str = "content";

/// `<container>_<provider>_<session uuid>`
pub fn session_dir_name(container: &str, provider: &str, session_id: SessionId) -> String {
    format!("{}_{}_{}", normalize_container(container), provider, session_id)
}

/// Where a published directory ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub content_hash: String,
    pub path: PathBuf,
    /// Identical content had already been published; the session copy was
    /// discarded.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sessions_root(&self) -> PathBuf {
        self.root.join(SESSIONS_DIR)
    }

    pub fn contents_root(&self) -> PathBuf {
        self.root.join(CONTENT_DIR)
    }

    pub fn session_dir(&self, container: &str, provider: &str, session_id: SessionId) -> PathBuf {
        self.sessions_root().join(session_dir_name(container, provider, session_id))
    }

    pub fn content_dir(&self, content_hash: &str) -> PathBuf {
        self.contents_root().join(content_hash)
    }

    /// Create (if needed) and return the session directory.
    pub async fn prepare_session_dir(
        &self,
        container: &str,
        provider: &str,
        session_id: SessionId,
    ) -> Result<PathBuf> {
        let dir = self.session_dir(container, provider, session_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Move a finished session directory to its content-addressed location.
    pub async fn publish(&self, session_dir: &Path) -> Result<Published> {
        let content_hash = hash_directory(session_dir).await?;
        let target = self.content_dir(&content_hash);

        if tokio::fs::try_exists(&target).await? {
            tokio::fs::remove_dir_all(session_dir).await?;
            tracing::debug!(content_hash = %content_hash, "Content already published, session copy removed");
            return Ok(Published {
                content_hash,
                path: target,
                deduplicated: true,
            });
        }

        tokio::fs::create_dir_all(self.root.join(CONTENT_DIR)).await?;
        move_dir(session_dir, &target).await?;
        tracing::info!(
            content_hash = %content_hash,
            from = %session_dir.display(),
            "Published session output"
        );
        Ok(Published {
            content_hash,
            path: target,
            deduplicated: false,
        })
    }

    /// Current location of a session's output: the content directory when
    /// published, otherwise the session directory.
    pub fn resolve_session_dir(
        &self,
        container: &str,
        provider: &str,
        session_id: SessionId,
        content_hash: Option<&str>,
    ) -> Result<PathBuf> {
        if let Some(hash) = content_hash {
            let published = self.content_dir(hash);
            if published.is_dir() {
                return Ok(published);
            }
        }
        let dir = self.session_dir(container, provider, session_id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(Error::not_found("session output", session_id))
        }
    }
}

/// Rename `from` to `to`, falling back to copy + remove when the two are on
/// different filesystems.
async fn move_dir(from: &Path, to: &Path) -> Result<()> {
    let rename_err = match tokio::fs::rename(from, to).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    tracing::debug!(
        from = %from.display(),
        to = %to.display(),
        error = %rename_err,
        "Rename failed, copying instead"
    );

    let (src, dst) = (from.to_path_buf(), to.to_path_buf());
    let copied = tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dst))
        .await
        .map_err(|e| Error::Internal(format!("copy task failed: {e}")))?;
    if let Err(e) = copied {
        let _ = tokio::fs::remove_dir_all(to).await;
        return Err(e);
    }
    tokio::fs::remove_dir_all(from).await?;
    Ok(())
}

fn copy_dir_blocking(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::Storage(format!("walk {}: {e}", from.display())))?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest)?;
        } else {
            std::fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// SHA-256 over every file below `dir`: relative path, then contents, in
/// path order.
pub async fn hash_directory(dir: &Path) -> Result<String> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || hash_directory_blocking(&dir))
        .await
        .map_err(|e| Error::Internal(format!("hash task failed: {e}")))?
}

fn hash_directory_blocking(dir: &Path) -> Result<String> {
    if !dir.is_dir() {
        return Err(Error::not_found("directory", dir.display()));
    }

    let mut hasher = Sha256::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Storage(format!("walk {}: {e}", dir.display())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let mut file = File::open(entry.path())?;
        io::copy(&mut file, &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}
