use crate::error::AppError;
use crate::utils::path_utils::{clean_path, is_within};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Writes `paths` into a new zip at `archive_path`. Entry names are relative to
/// `base`. Symlinks are followed, so the archive carries the link target's
/// content. Returns the number of file entries written.
pub fn zip_paths(base: &Path, archive_path: &Path, paths: &[PathBuf]) -> Result<usize, AppError> {
    if fs::symlink_metadata(archive_path).is_ok() {
        return Err(AppError::Conflict(format!("{} already exists", archive_path.display())));
    }
    let out_file = File::create(archive_path)?;
    let mut writer = ZipWriter::new(BufWriter::new(out_file));
    let mut visited = HashSet::new();
    let mut written = 0;

    let result = paths.iter().try_for_each(|path| {
        add_path(&mut writer, base, archive_path, path, &mut visited, &mut written)
    });
    if let Err(e) = result {
        drop(writer);
        let _ = fs::remove_file(archive_path);
        return Err(e);
    }
    writer.finish()?;
    debug!(archive = %archive_path.display(), entries = written, "Archive written");
    Ok(written)
}

fn entry_name(base: &Path, path: &Path) -> Result<String, AppError> {
    let relative = path
        .strip_prefix(base)
        .map_err(|_| AppError::Forbidden(format!("{} is outside of the archive base", path.display())))?;
    let name = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    if name.is_empty() {
        return Err(AppError::BadRequest("Cannot archive the server directory itself".to_string()));
    }
    Ok(name)
}

fn add_path<W: io::Write + io::Seek>(
    writer: &mut ZipWriter<W>,
    base: &Path,
    archive_path: &Path,
    path: &Path,
    visited: &mut HashSet<PathBuf>,
    written: &mut usize,
) -> Result<(), AppError> {
    if path == archive_path {
        return Ok(());
    }
    // fs::metadata follows symlinks.
    let metadata = fs::metadata(path)?;
    let name = entry_name(base, path)?;
    let mut options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        options = options.unix_permissions(metadata.permissions().mode() & 0o777);
    }

    if metadata.is_dir() {
        // Guard against symlink cycles.
        if !visited.insert(fs::canonicalize(path)?) {
            return Ok(());
        }
        writer.add_directory(format!("{}/", name), options)?;
        let mut children: Vec<_> = fs::read_dir(path)?.collect::<Result<_, _>>()?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            add_path(writer, base, archive_path, &child.path(), visited, written)?;
        }
    } else {
        writer.start_file(name, options)?;
        let mut file = File::open(path)?;
        io::copy(&mut file, writer)?;
        *written += 1;
    }
    Ok(())
}

/// Extracts `archive_path` into `destination`. Entries whose path would land
/// outside the cleaned destination are skipped. Returns the number of files
/// extracted.
pub fn unzip(archive_path: &Path, destination: &Path) -> Result<usize, AppError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let clean_destination = clean_path(destination);
    create_dir_all_open(&clean_destination)?;
    let mut extracted = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let target = clean_path(&clean_destination.join(entry.name()));
        if !is_within(&clean_destination, &target) || target == clean_destination {
            warn!(entry = %entry.name(), archive = %archive_path.display(), "Skipping archive entry outside of destination");
            continue;
        }

        if entry.is_dir() {
            create_dir_all_open(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            create_dir_all_open(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))?;
        }
        extracted += 1;
    }
    debug!(archive = %archive_path.display(), destination = %clean_destination.display(), files = extracted, "Archive extracted");
    Ok(extracted)
}

fn create_dir_all_open(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777);
    }
    builder.create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use tempfile::tempdir;

    #[test]
    fn zip_then_unzip_restores_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("world/region")).unwrap();
        fs::write(root.join("world/region/r.0.0"), b"chunk").unwrap();
        fs::write(root.join("server.properties"), b"motd=hi").unwrap();

        let archive = root.join("backup.zip");
        let written = zip_paths(root, &archive, &[root.join("world"), root.join("server.properties")]).unwrap();
        assert_eq!(written, 2);

        let out = root.join("restore");
        assert_eq!(unzip(&archive, &out).unwrap(), 2);
        assert_eq!(fs::read(out.join("world/region/r.0.0")).unwrap(), b"chunk");
        assert_eq!(fs::read(out.join("server.properties")).unwrap(), b"motd=hi");
    }

    #[test]
    fn zip_refuses_existing_archive() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.zip"), b"").unwrap();
        let result = zip_paths(dir.path(), &dir.path().join("a.zip"), &[]);
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }

    #[test]
    fn crafted_entries_are_skipped() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        {
            let mut writer = ZipWriter::new(File::create(&archive).unwrap());
            let options = FileOptions::default();
            writer.start_file("../escaped.txt", options).unwrap();
            writer.write_all(b"nope").unwrap();
            writer.start_file("nested/../../escaped2.txt", options).unwrap();
            writer.write_all(b"nope").unwrap();
            writer.start_file("ok.txt", options).unwrap();
            writer.write_all(b"fine").unwrap();
            writer.finish().unwrap();
        }

        let dest = dir.path().join("out");
        assert_eq!(unzip(&archive, &dest).unwrap(), 1);
        assert!(!dir.path().join("escaped.txt").exists());
        assert!(!dir.path().join("escaped2.txt").exists());
        assert_eq!(fs::read_to_string(dest.join("ok.txt")).unwrap(), "fine");
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_archived_as_their_target() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("real.txt"), b"payload").unwrap();
        std::os::unix::fs::symlink(root.join("real.txt"), root.join("link.txt")).unwrap();

        let archive = root.join("links.zip");
        zip_paths(root, &archive, &[root.join("link.txt")]).unwrap();

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut content = String::new();
        zip.by_name("link.txt").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "payload");
    }
}
