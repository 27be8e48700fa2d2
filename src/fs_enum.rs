// Source enumeration for the sender: regular files only, stable order
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::TransferError;

/// Regular file found under the transfer base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Forward-slash separated path relative to the base directory
    pub relative: String,
}

/// Directory that relative paths are computed against: the source itself
/// when it is a directory, otherwise its parent.
pub fn base_dir(source: &Path) -> PathBuf {
    if source.is_dir() {
        source.to_path_buf()
    } else {
        source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

/// Join the components of `rel` with `/`, independent of host separators.
pub fn to_archive_path(rel: &Path) -> Result<String, TransferError> {
    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => parts.push(
                s.to_str()
                    .ok_or_else(|| TransferError::InvalidPath(rel.to_path_buf()))?,
            ),
            Component::CurDir => {}
            _ => return Err(TransferError::InvalidPath(rel.to_path_buf())),
        }
    }
    Ok(parts.join("/"))
}

/// Lazily walk `source`, yielding every regular file exactly once.
///
/// Siblings are visited in file-name order. Directories, symlinks and
/// special files are skipped; walk errors are yielded and abort the send.
pub fn enumerate_source(
    source: &Path,
) -> impl Iterator<Item = Result<SourceFile, TransferError>> {
    let base = base_dir(source);
    WalkDir::new(source)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => return Some(Err(TransferError::Walk(e))),
            };
            if !entry.file_type().is_file() {
                if !entry.file_type().is_dir() {
                    tracing::debug!(path = %entry.path().display(), "skipping non-regular file");
                }
                return None;
            }
            let rel = entry.path().strip_prefix(&base).unwrap_or(entry.path());
            Some(to_archive_path(rel).map(|relative| SourceFile {
                path: entry.path().to_path_buf(),
                relative,
            }))
        })
}
