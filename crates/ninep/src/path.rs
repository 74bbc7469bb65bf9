//! Path cleaning and resolution.
//!
//! `clean` mirrors the classic Plan 9 / Go `path.Clean` algorithm: a single
//! left-to-right pass tracking a "floor" past which a leading run of `..`
//! components cannot be popped.

use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::utils::Result;

/// Maximum resolved path length this server will accept (Linux `PATH_MAX`).
const MAX_PATH_LEN: usize = 4096;

pub fn clean(p: &str) -> String {
    if p.is_empty() {
        return ".".to_string();
    }

    let bytes = p.as_bytes();
    let rooted = bytes[0] == b'/';
    let start = if rooted { 1 } else { 0 };

    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    if rooted {
        out.push(b'/');
    }

    let mut dotdot = start;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'/' {
            i += 1;
        } else if bytes[i] == b'.' && (i + 1 == bytes.len() || bytes[i + 1] == b'/') {
            // "." component: skip.
            i += 1;
        } else if bytes[i] == b'.'
            && i + 1 < bytes.len()
            && bytes[i + 1] == b'.'
            && (i + 2 == bytes.len() || bytes[i + 2] == b'/')
        {
            // ".." component.
            i += 2;
            if out.len() > dotdot {
                let mut w = out.len() - 1;
                while w > dotdot && out[w] != b'/' {
                    w -= 1;
                }
                out.truncate(w);
            } else if !rooted {
                if !out.is_empty() {
                    out.push(b'/');
                }
                out.push(b'.');
                out.push(b'.');
                dotdot = out.len();
            }
            // rooted and nothing left to pop: drop the ".." silently.
        } else {
            if out.len() != start {
                out.push(b'/');
            }
            while i < bytes.len() && bytes[i] != b'/' {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    if out.is_empty() {
        return if rooted { "/".to_string() } else { ".".to_string() };
    }
    String::from_utf8(out).expect("clean() only ever appends bytes drawn from a valid &str")
}

/// Join `exported_root` with the cleaned form of `client_path`, refusing any
/// path that still escapes after cleaning.
pub fn resolve(client_path: &str, exported_root: &Path) -> Result<PathBuf> {
    if client_path.is_empty() {
        return Err(Error::path("empty path"));
    }

    let cleaned = clean(client_path);
    if cleaned.split('/').any(|seg| seg == "..") {
        return Err(Error::path(format!("path escapes exported root: {client_path}")));
    }

    let mut full = exported_root.to_path_buf();
    full.push(cleaned.trim_start_matches('/'));

    if full.as_os_str().len() > MAX_PATH_LEN {
        return Err(Error::path("path too long"));
    }

    Ok(full)
}
