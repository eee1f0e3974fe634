//! Per-instance sandbox directories.
//!
//! Each instance owns exactly one directory `<root>/<id>`, seeded with a
//! couple of text files for the restricted shell to look at. Nothing here
//! provides kernel-level isolation; the directory only scopes which files
//! the allowed commands can reach.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files written into every fresh sandbox.
pub const SEED_FILES: &[(&str, &str)] = &[
    (
        "readme.txt",
        "Welcome to the sandbox. Try ls, cat readme.txt, and pwd.\n",
    ),
    (
        "notes.txt",
        "The flag is not stored in these files. Check the page source.\n",
    ),
];

/// Ensure the sandbox directory for `id` exists under `root` and return its
/// canonical path.
///
/// Seeds the directory only when this call created it. Calling again for the
/// same id returns the existing path untouched.
pub fn provision(root: &Path, id: &str) -> Result<PathBuf, String> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(format!("invalid sandbox id: {:?}", id));
    }

    fs::create_dir_all(root).map_err(|e| format!("mkdir root: {}", e))?;

    let sandbox_dir = root.join(id);
    match fs::create_dir(&sandbox_dir) {
        Ok(()) => {
            seed(&sandbox_dir)?;
            info!(path = ?sandbox_dir, "Provisioned sandbox");
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            debug!(path = ?sandbox_dir, "Sandbox already exists");
        }
        Err(e) => return Err(format!("mkdir sandbox: {}", e)),
    }

    fs::canonicalize(&sandbox_dir).map_err(|e| format!("canonicalize: {}", e))
}

fn seed(sandbox_dir: &Path) -> Result<(), String> {
    for (name, content) in SEED_FILES {
        let path = sandbox_dir.join(name);
        fs::write(&path, content).map_err(|e| format!("write {}: {}", name, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444))
            .map_err(|e| format!("chmod {}: {}", name, e))?;
    }
    Ok(())
}

/// Recursively remove a sandbox directory.
///
/// A path that is already gone is fine. Any other failure is logged and
/// swallowed so the caller (a request or the sweeper) keeps going.
pub fn cleanup(sandbox_dir: &Path) {
    match fs::remove_dir_all(sandbox_dir) {
        Ok(()) => info!(path = ?sandbox_dir, "Removed sandbox"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = ?sandbox_dir, "Sandbox already removed");
        }
        Err(e) => warn!(path = ?sandbox_dir, error = %e, "Failed to remove sandbox"),
    }
}
