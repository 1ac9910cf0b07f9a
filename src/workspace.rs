//! Purpose: Persist serialized session environments ("workspaces") by owner-scoped path.
//! Exports: `WorkspaceStore`, `DirWorkspaceStore`, `WorkspaceInfo`, `workspace_path`, `check_workspace_path`.
//! Role: Storage seam used by the save/load operations run on session workers.
//! Invariants: Paths are exactly `<owner>/<name>.RData`; anything else is rejected before touching disk.
//! Invariants: Writes land via temp file + rename under an exclusive `fs2` lock on `<root>/.lock`.
//! Invariants: Missing workspaces are `NotFound`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::error::{Error, ErrorKind};

pub const WORKSPACE_EXTENSION: &str = "RData";
const LOCK_FILE: &str = ".lock";

pub fn workspace_path(owner: &str, name: &str) -> String {
    format!("{owner}/{name}.{WORKSPACE_EXTENSION}")
}

/// Rejects anything that is not a well-formed `<owner>/<name>.RData` store path.
pub fn check_workspace_path(path: &str) -> Result<(), Error> {
    split_store_path(path).map(|_| ())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkspaceInfo {
    pub name: String,
    pub size: u64,
    pub last_modified: Option<String>,
    pub sha256: String,
}

pub trait WorkspaceStore: Send + Sync {
    fn save(&self, path: &str, bytes: &[u8]) -> Result<(), Error>;
    fn load(&self, path: &str) -> Result<Vec<u8>, Error>;
    fn delete(&self, path: &str) -> Result<(), Error>;
    fn list(&self, owner: &str) -> Result<Vec<WorkspaceInfo>, Error>;
}

#[derive(Clone, Debug)]
pub struct DirWorkspaceStore {
    root: PathBuf,
}

impl DirWorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|err| io_error(&err, "failed to create workspace dir", &root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, Error> {
        let (owner, file) = split_store_path(path)?;
        Ok(self.root.join(owner).join(file))
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock, Error> {
        let path = self.root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|err| io_error(&err, "failed to open store lock", &path))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|err| io_error(&err, "failed to lock workspace store", &path))?;
        Ok(StoreLock { file })
    }
}

struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl WorkspaceStore for DirWorkspaceStore {
    fn save(&self, path: &str, bytes: &[u8]) -> Result<(), Error> {
        let target = self.resolve(path)?;
        let _lock = self.lock(true)?;
        let dir = target.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|err| io_error(&err, "failed to create owner dir", dir))?;
        let file_name = target
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("workspace");
        let temp = dir.join(format!(".{file_name}.tmp"));
        {
            let mut file = File::create(&temp)
                .map_err(|err| io_error(&err, "failed to create workspace", &temp))?;
            file.write_all(bytes)
                .and_then(|_| file.sync_all())
                .map_err(|err| io_error(&err, "failed to write workspace", &temp))?;
        }
        fs::rename(&temp, &target).map_err(|err| io_error(&err, "failed to publish workspace", &target))?;
        tracing::debug!(path, size = bytes.len(), "saved workspace");
        Ok(())
    }

    fn load(&self, path: &str) -> Result<Vec<u8>, Error> {
        let target = self.resolve(path)?;
        let _lock = self.lock(false)?;
        fs::read(&target).map_err(|err| missing_or_io(err, "read", path, &target))
    }

    fn delete(&self, path: &str) -> Result<(), Error> {
        let target = self.resolve(path)?;
        let _lock = self.lock(true)?;
        fs::remove_file(&target).map_err(|err| missing_or_io(err, "delete", path, &target))
    }

    fn list(&self, owner: &str) -> Result<Vec<WorkspaceInfo>, Error> {
        if !is_segment(owner) {
            return Err(Error::new(ErrorKind::Usage).with_message(format!("invalid workspace owner '{owner}'")));
        }
        let dir = self.root.join(owner);
        let _lock = self.lock(false)?;
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&err, "failed to read workspace dir", &dir)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&err, "failed to read workspace dir entry", &dir))?;
            let path = entry.path();
            let Some(name) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(&format!(".{WORKSPACE_EXTENSION}")))
                .map(str::to_string)
            else {
                continue;
            };
            if !is_segment(&name) {
                continue;
            }
            let bytes = fs::read(&path).map_err(|err| io_error(&err, "failed to read workspace", &path))?;
            let last_modified = entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok())
                .and_then(|modified| OffsetDateTime::from(modified).format(&Rfc3339).ok());
            out.push(WorkspaceInfo {
                name,
                size: bytes.len() as u64,
                last_modified,
                sha256: sha256_hex(&bytes),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn missing_or_io(err: io::Error, action: &str, path: &str, target: &Path) -> Error {
    let kind = map_io_error_kind(&err);
    let message = if kind == ErrorKind::NotFound {
        format!("workspace '{path}' not found")
    } else {
        format!("failed to {action} workspace '{path}'")
    };
    Error::new(kind)
        .with_message(message)
        .with_path(target)
        .with_source(err)
}

/// Splits `<owner>/<name>.RData` into its owner dir and file name.
fn split_store_path(path: &str) -> Result<(&str, &str), Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid workspace path '{path}'"))
            .with_hint(format!("Expected <owner>/<name>.{WORKSPACE_EXTENSION}."))
    };
    let (owner, file) = path.split_once('/').ok_or_else(invalid)?;
    let name = file
        .strip_suffix(&format!(".{WORKSPACE_EXTENSION}"))
        .ok_or_else(invalid)?;
    if !is_segment(owner) || !is_segment(name) {
        return Err(invalid());
    }
    Ok((owner, file))
}

/// Owners may be e-mail style user ids; names are plain workspace ids.
fn is_segment(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn io_error(err: &io::Error, message: &str, path: &Path) -> Error {
    Error::new(map_io_error_kind(err))
        .with_message(message)
        .with_path(path)
}

fn map_io_error_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::{DirWorkspaceStore, WorkspaceStore, split_store_path, workspace_path};
    use crate::core::error::ErrorKind;

    #[test]
    fn save_load_list_delete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DirWorkspaceStore::new(temp.path().join("ws")).expect("store");
        let path = workspace_path("henk", "test");
        assert_eq!(path, "henk/test.RData");

        store.save(&path, b"workspace-bytes").expect("save");
        assert!(temp.path().join("ws/henk/test.RData").is_file());
        assert_eq!(store.load(&path).expect("load"), b"workspace-bytes");

        store.save(&path, b"v2").expect("overwrite");
        assert_eq!(store.load(&path).expect("load"), b"v2");

        let listed = store.list("henk").expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "test");
        assert_eq!(listed[0].size, 2);
        assert_eq!(listed[0].sha256.len(), 64);
        assert!(store.list("nobody").expect("empty").is_empty());

        store.delete(&path).expect("delete");
        assert!(!temp.path().join("ws/henk/test.RData").exists());
        let err = store.delete(&path).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = store.load(&path).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn rejects_paths_outside_owner_dirs() {
        for bad in ["test.RData", "../x.RData", "a/b/c.RData", "henk/test.txt", "henk/.RData", "/x.RData"] {
            let err = split_store_path(bad).expect_err(bad);
            assert_eq!(err.kind(), ErrorKind::Usage, "{bad}");
        }
        assert_eq!(
            split_store_path("DIABETES/patient.RData").expect("ok"),
            ("DIABETES", "patient.RData")
        );
    }
}
