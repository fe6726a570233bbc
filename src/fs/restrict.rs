use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::Predicate;

/// Shared package cache of the host; never visible to build scripts.
pub const DEFAULT_SYSTEM_CACHE_DIR: &str = "/var/cache/pkgjail";

/// Control sockets of the host service.
pub const DEFAULT_SOCKET_DIR: &str = "/run/pkgjail";

/// Lexically normalise a path: drop `.`, fold `..` into its parent and collapse
/// separators. Symlinks are not resolved. An empty path becomes `.`.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

/// True when `path` equals `prefix` or lies below it, compared component-wise
/// after cleaning (`/var/cachex` is not under `/var/cache`).
pub fn has_path_prefix(path: &Path, prefix: &Path) -> bool {
    clean_path(path).starts_with(clean_path(prefix))
}

/// Predicate hiding the host cache and socket trees, except for paths leading
/// to or inside one of `allowed`.
pub fn restrict_sandbox<I, P>(allowed: I) -> Predicate
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    restrict_sandbox_with(
        [DEFAULT_SYSTEM_CACHE_DIR, DEFAULT_SOCKET_DIR],
        allowed,
    )
}

/// Like [`restrict_sandbox`] with an explicit deny-list.
///
/// Paths outside every denied tree are always allowed. Inside a denied tree a
/// path is allowed only if it is inside, or an ancestor of, an allowed root.
pub fn restrict_sandbox_with<D, DP, I, P>(denied: D, allowed: I) -> Predicate
where
    D: IntoIterator<Item = DP>,
    DP: AsRef<Path>,
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let denied: Vec<PathBuf> = denied
        .into_iter()
        .map(|p| clean_path(p.as_ref()))
        .collect();
    let allowed: Vec<PathBuf> = allowed
        .into_iter()
        .map(|p| clean_path(p.as_ref()))
        .collect();

    Arc::new(move |path: &Path| {
        let path = clean_path(path);
        if !denied.iter().any(|root| path.starts_with(root)) {
            return true;
        }
        allowed
            .iter()
            .any(|root| path.starts_with(root) || root.starts_with(&path))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restrict_sandbox_cases() {
        let cache = Path::new(DEFAULT_SYSTEM_CACHE_DIR);
        let cases: Vec<(&str, Vec<PathBuf>, PathBuf, bool)> = vec![
            ("system cache denied", vec![], cache.to_path_buf(), false),
            (
                "socket dir denied",
                vec![],
                PathBuf::from(DEFAULT_SOCKET_DIR),
                false,
            ),
            (
                "inside allowed root",
                vec![PathBuf::from("/home/user")],
                PathBuf::from("/home/user/docs"),
                true,
            ),
            (
                "outside every denied tree",
                vec![PathBuf::from("/home/user")],
                PathBuf::from("/etc/config"),
                true,
            ),
            (
                "ancestor of allowed root",
                vec![PathBuf::from("/home/user/docs")],
                PathBuf::from("/home/user"),
                true,
            ),
            (
                "sibling of allowed root inside cache",
                vec![cache.join("foo")],
                cache.join("bar"),
                false,
            ),
            (
                "allowed root inside cache",
                vec![cache.join("foo")],
                cache.join("foo/src/main.c"),
                true,
            ),
            (
                "cache itself is an ancestor of the allowed root",
                vec![cache.join("foo")],
                cache.to_path_buf(),
                true,
            ),
        ];

        for (name, allowed, path, expected) in cases {
            let predicate = restrict_sandbox(&allowed);
            assert_eq!(predicate(&path), expected, "{name}: {}", path.display());
        }
    }

    #[test]
    fn test_dotdot_cannot_escape_into_denied_tree() {
        let predicate = restrict_sandbox(["/home/user"]);
        let sneaky = Path::new("/home/user/../../var/cache/pkgjail/secrets");
        assert!(!predicate(sneaky));
    }

    #[test]
    fn test_has_path_prefix_is_component_wise() {
        assert!(has_path_prefix(Path::new("/var/cache"), Path::new("/var/cache")));
        assert!(has_path_prefix(Path::new("/var/cache/x"), Path::new("/var/cache/")));
        assert!(!has_path_prefix(Path::new("/var/cachex"), Path::new("/var/cache")));
        assert!(has_path_prefix(Path::new("/a/./b/../c"), Path::new("/a/c")));
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("")), PathBuf::from("."));
        assert_eq!(clean_path(Path::new("/../a//b/./")), PathBuf::from("/a/b"));
        assert_eq!(clean_path(Path::new("../x/..")), PathBuf::from(".."));
    }

    #[test]
    fn test_explicit_deny_list() {
        let predicate = restrict_sandbox_with(["/srv/cache"], ["/srv/cache/pkg"]);
        assert!(!predicate(Path::new("/srv/cache/other")));
        assert!(predicate(Path::new("/srv/cache/pkg/file")));
        assert!(predicate(Path::new(DEFAULT_SYSTEM_CACHE_DIR)));
    }
}
