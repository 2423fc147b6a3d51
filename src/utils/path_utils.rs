use crate::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Lexically normalizes a path: drops `.` components and folds `..` into the
/// preceding normal component. `..` at the root of an absolute path is dropped,
/// at the start of a relative path it is kept.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut components: Vec<Component> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => components.push(component),
            },
            _ => components.push(component),
        }
    }
    if components.is_empty() {
        return PathBuf::from(".");
    }
    components.iter().collect()
}

/// True when `path` (already cleaned) lies inside `root` (already cleaned) or is `root` itself.
pub fn is_within(root: &Path, path: &Path) -> bool {
    path.starts_with(root)
}

/// Joins a user supplied path onto a sandbox root and rejects anything that
/// normalizes to a location outside of it. An absolute user path replaces the
/// root on join and is therefore rejected unless it already points inside.
pub fn resolve(root: &Path, user_path: &str) -> Result<PathBuf, AppError> {
    let clean_root = clean_path(root);
    let joined = clean_path(&clean_root.join(user_path));
    if !is_within(&clean_root, &joined) {
        debug!(root = %clean_root.display(), path = %user_path, "Rejected path outside of sandbox");
        return Err(AppError::Forbidden(format!("Path {} is outside of the server directory", user_path)));
    }
    Ok(joined)
}

/// Like [`resolve`], but additionally refuses the sandbox root itself. Used by
/// destructive operations (delete, move source).
pub fn resolve_below_root(root: &Path, user_path: &str) -> Result<PathBuf, AppError> {
    let resolved = resolve(root, user_path)?;
    if resolved == clean_path(root) {
        return Err(AppError::Forbidden("Operation not allowed on the server directory itself".to_string()));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_forbidden() {
        let root = Path::new("/srv/game");
        assert!(matches!(resolve(root, "../../etc/passwd"), Err(AppError::Forbidden(_))));
        assert!(matches!(resolve(root, "world/../../other"), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn absolute_override_is_forbidden() {
        let root = Path::new("/srv/game");
        assert!(matches!(resolve(root, "/etc/passwd"), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn sibling_with_shared_prefix_is_forbidden() {
        let root = Path::new("/srv/game");
        assert!(resolve(root, "../game2/secret").is_err());
    }

    #[test]
    fn nested_path_resolves_under_root() {
        let root = Path::new("/srv/./game/");
        let resolved = resolve(root, "sub/dir").expect("inside root");
        assert_eq!(resolved, PathBuf::from("/srv/game/sub/dir"));
        assert!(resolved.starts_with(clean_path(root)));
    }

    #[test]
    fn dot_dot_inside_root_is_folded() {
        let root = Path::new("/srv/game");
        assert_eq!(resolve(root, "a/b/../c").unwrap(), PathBuf::from("/srv/game/a/c"));
        assert_eq!(resolve(root, ".").unwrap(), PathBuf::from("/srv/game"));
    }

    #[test]
    fn destructive_ops_refuse_root() {
        let root = Path::new("/srv/game");
        assert!(matches!(resolve_below_root(root, "."), Err(AppError::Forbidden(_))));
        assert!(matches!(resolve_below_root(root, "a/.."), Err(AppError::Forbidden(_))));
        assert!(resolve_below_root(root, "a").is_ok());
    }

    #[test]
    fn clean_path_keeps_leading_parent_of_relative() {
        assert_eq!(clean_path(Path::new("../a/./b")), PathBuf::from("../a/b"));
        assert_eq!(clean_path(Path::new("/../a")), PathBuf::from("/a"));
    }
}
