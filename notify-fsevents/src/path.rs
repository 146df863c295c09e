//! Conversion between paths and the NUL-terminated byte strings the native service works with.

use crate::{Error, Result};
use std::ffi::CString;
use std::path::{Path, PathBuf};

/// Encodes a path for the native service.
///
/// Fails with [`ErrorKind::InvalidPath`](crate::ErrorKind::InvalidPath) if the path contains a
/// NUL byte, or on non-Unix hosts if it is not valid Unicode.
pub fn encode(path: &Path) -> Result<CString> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = match path.to_str() {
        Some(s) => s.as_bytes().to_vec(),
        None => return Err(Error::invalid_path().add_path(path.to_path_buf())),
    };

    CString::new(bytes).map_err(|_| Error::invalid_path().add_path(path.to_path_buf()))
}

/// Encodes every path, failing on the first one that cannot be represented.
pub fn encode_all<I, P>(paths: I) -> Result<Vec<CString>>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    paths.into_iter().map(|p| encode(p.as_ref())).collect()
}

/// Decodes a path handed back by the native service.
pub fn decode(bytes: &[u8]) -> PathBuf {
    #[cfg(unix)]
    {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;
        PathBuf::from(OsStr::from_bytes(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
    }
}
