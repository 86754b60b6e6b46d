use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// A client-supplied path escaped the sanctioned sessions root.
#[derive(Debug, Error)]
#[error("path {} is outside of allowed directory {}", .path.display(), .root.display())]
pub struct PathViolation {
    pub path: PathBuf,
    pub root: PathBuf,
}

/// Validate that `path` resolves to a descendant of `base`.
///
/// Normalization is lexical (`.` and `..` segments collapsed) because the
/// endpoints a request names are allowed to not exist yet at validation time.
/// Returns the normalized path on success.
pub fn ensure_within(path: &Path, base: &Path) -> Result<PathBuf, PathViolation> {
    let violation = || PathViolation {
        path: path.to_path_buf(),
        root: base.to_path_buf(),
    };

    if !path.is_absolute() {
        return Err(violation());
    }

    let normalized = match normalize(path) {
        Some(p) => p,
        None => return Err(violation()),
    };
    let base = normalize(base).ok_or_else(violation)?;

    // Component-wise prefix check, so `/srv/sessions-evil` does not pass
    // as a child of `/srv/sessions`.
    if normalized.starts_with(&base) {
        Ok(normalized)
    } else {
        Err(violation())
    }
}

/// Collapse `.` and `..` segments without touching the filesystem.
/// Returns `None` when `..` would climb above the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_descendant() {
        let ok = ensure_within(Path::new("/srv/sessions/s1/in"), Path::new("/srv/sessions"));
        assert_eq!(ok.unwrap(), PathBuf::from("/srv/sessions/s1/in"));
    }

    #[test]
    fn accepts_dot_segments_that_stay_inside() {
        let ok = ensure_within(
            Path::new("/srv/sessions/s1/./sub/../in"),
            Path::new("/srv/sessions"),
        );
        assert_eq!(ok.unwrap(), PathBuf::from("/srv/sessions/s1/in"));
    }

    #[test]
    fn rejects_traversal_out_of_root() {
        assert!(ensure_within(
            Path::new("/srv/sessions/../secrets"),
            Path::new("/srv/sessions")
        )
        .is_err());
    }

    #[test]
    fn rejects_sibling_with_common_prefix() {
        assert!(ensure_within(
            Path::new("/srv/sessions-evil/s1"),
            Path::new("/srv/sessions")
        )
        .is_err());
    }

    #[test]
    fn rejects_relative_path() {
        assert!(ensure_within(Path::new("s1/in"), Path::new("/srv/sessions")).is_err());
    }

    #[test]
    fn rejects_climb_above_filesystem_root() {
        assert!(ensure_within(Path::new("/../../etc"), Path::new("/")).is_err());
    }

    #[test]
    fn base_itself_is_within() {
        assert!(ensure_within(Path::new("/srv/sessions"), Path::new("/srv/sessions")).is_ok());
    }
}
