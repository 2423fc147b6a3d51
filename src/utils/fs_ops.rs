use crate::error::AppError;
use crate::utils::path_utils::{resolve, resolve_below_root};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DirEntryInfo {
    pub name: String,
    pub folder: bool,
    pub size: u64,
    pub last_modified: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Move,
    Copy,
}

impl TransferOp {
    pub fn parse(op: &str) -> Result<Self, AppError> {
        match op.trim().to_lowercase().as_str() {
            "mv" => Ok(TransferOp::Move),
            "cp" => Ok(TransferOp::Copy),
            other => Err(AppError::BadRequest(format!("Invalid operation: {}", other))),
        }
    }
}

pub fn list_directory(root: &Path, user_path: &str) -> Result<Vec<DirEntryInfo>, AppError> {
    let path = resolve(root, user_path)?;
    let metadata = fs::metadata(&path)?;
    if !metadata.is_dir() {
        return Err(AppError::BadRequest("This is not a folder!".to_string()));
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(&path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Follow symlinks so a link to a folder lists as a folder; dangling links fall back to the link itself.
        let meta = match fs::metadata(entry.path()) {
            Ok(m) => m,
            Err(_) => entry.metadata()?,
        };
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mime_type = if meta.is_dir() {
            "inode/directory".to_string()
        } else {
            mime_guess::from_path(&name).first_or_octet_stream().to_string()
        };
        entries.push(DirEntryInfo {
            name,
            folder: meta.is_dir(),
            size: meta.len(),
            last_modified,
            mime_type,
        });
    }
    entries.sort_by(|a, b| b.folder.cmp(&a.folder).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

pub fn create_folder(root: &Path, user_path: &str) -> Result<PathBuf, AppError> {
    let path = resolve_below_root(root, user_path)?;
    debug!(path = %path.display(), "Creating folder");
    fs::create_dir(&path)?;
    Ok(path)
}

pub fn delete_path(root: &Path, user_path: &str) -> Result<PathBuf, AppError> {
    let path = resolve_below_root(root, user_path)?;
    let metadata = fs::symlink_metadata(&path)?;
    debug!(path = %path.display(), is_dir = metadata.is_dir(), "Deleting path");
    if metadata.is_dir() {
        fs::remove_dir_all(&path)?;
    } else {
        fs::remove_file(&path)?;
    }
    Ok(path)
}

/// Moves or copies `src` to `dst`, both relative to the sandbox root. When the
/// destination is an existing folder the source lands inside it under its own
/// name; any other existing destination is a conflict.
pub fn transfer(root: &Path, src: &str, dst: &str, op: TransferOp) -> Result<PathBuf, AppError> {
    let source = resolve_below_root(root, src)?;
    let mut destination = resolve(root, dst)?;

    if fs::symlink_metadata(&source).is_err() {
        return Err(AppError::NotFound(format!("{} does not exist", src)));
    }
    if destination.is_dir() {
        let base_name = source
            .file_name()
            .ok_or_else(|| AppError::BadRequest(format!("Invalid source path: {}", src)))?;
        destination = destination.join(base_name);
    }
    if fs::symlink_metadata(&destination).is_ok() {
        return Err(AppError::Conflict(format!("{} already exists", destination.display())));
    }
    if destination.starts_with(&source) {
        return Err(AppError::BadRequest("Cannot move or copy a folder into itself".to_string()));
    }

    debug!(source = %source.display(), destination = %destination.display(), op = ?op, "Transferring path");
    match op {
        TransferOp::Move => fs::rename(&source, &destination)?,
        TransferOp::Copy => copy_recursive(&source, &destination)?,
    }
    Ok(destination)
}

/// Copies a file or folder tree. File modes are carried over (`fs::copy`
/// preserves permissions), folders get the mode of their source.
pub fn copy_recursive(source: &Path, destination: &Path) -> Result<(), AppError> {
    let metadata = fs::metadata(source)?;
    if metadata.is_dir() {
        fs::create_dir(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &destination.join(entry.file_name()))?;
        }
        fs::set_permissions(destination, metadata.permissions())?;
    } else {
        fs::copy(source, destination)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_into_existing_folder_keeps_base_name() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("backup")).unwrap();

        let dest = transfer(dir.path(), "a.txt", "backup", TransferOp::Copy).unwrap();
        assert!(dest.ends_with("backup/a.txt"));
        assert_eq!(fs::read_to_string(dir.path().join("backup/a.txt")).unwrap(), "hello");
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn move_onto_existing_file_conflicts() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();

        let result = transfer(dir.path(), "a.txt", "b.txt", TransferOp::Move);
        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert_eq!(fs::read_to_string(dir.path().join("b.txt")).unwrap(), "b");
    }

    #[test]
    fn move_renames_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        transfer(dir.path(), "a.txt", "c.txt", TransferOp::Move).unwrap();
        assert!(!dir.path().join("a.txt").exists());
        assert!(dir.path().join("c.txt").exists());
    }

    #[test]
    fn transfer_rejects_escaping_destination() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let result = transfer(dir.path(), "a.txt", "../stolen.txt", TransferOp::Copy);
        assert!(matches!(result, Err(AppError::Forbidden(_))));
    }

    #[test]
    fn copy_folder_into_itself_is_rejected() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("world")).unwrap();
        let result = transfer(dir.path(), "world", "world", TransferOp::Copy);
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }

    #[cfg(unix)]
    #[test]
    fn copy_preserves_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();

        transfer(dir.path(), "run.sh", "run-copy.sh", TransferOp::Copy).unwrap();
        let mode = fs::metadata(dir.path().join("run-copy.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn delete_refuses_sandbox_root() {
        let dir = tempdir().unwrap();
        assert!(matches!(delete_path(dir.path(), "."), Err(AppError::Forbidden(_))));
        assert!(dir.path().exists());
    }

    #[test]
    fn list_directory_puts_folders_first() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(dir.path().join("z")).unwrap();
        let entries = list_directory(dir.path(), ".").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].folder);
        assert_eq!(entries[1].name, "a.txt");
        assert_eq!(entries[1].mime_type, "text/plain");
    }

    #[test]
    fn create_folder_twice_conflicts() {
        let dir = tempdir().unwrap();
        create_folder(dir.path(), "logs").unwrap();
        let err = create_folder(dir.path(), "logs").unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::CONFLICT);
    }

    #[test]
    fn parse_transfer_op() {
        assert_eq!(TransferOp::parse("MV").unwrap(), TransferOp::Move);
        assert_eq!(TransferOp::parse("cp").unwrap(), TransferOp::Copy);
        assert!(TransferOp::parse("rm").is_err());
    }
}
