use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Checks that `name` names a directory strictly below a store root and
/// returns it with `.` segments dropped.
///
/// Backslashes, drive letters and NUL bytes are refused on every platform
/// so a name accepted here means the same thing everywhere.
pub fn validate_upload_path(name: &str) -> Result<PathBuf, TransferError> {
    let invalid = |why: &str| TransferError::InvalidPath(format!("{why}: {name:?}"));

    if name.contains(['\\', ':', '\0']) {
        return Err(invalid("reserved character"));
    }

    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent traversal")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("absolute path")),
        }
    }

    if relative.as_os_str().is_empty() || name.trim().is_empty() {
        return Err(invalid("empty destination"));
    }
    Ok(relative)
}
