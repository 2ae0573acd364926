//! Executable path resolution for provider commands.
//!
//! Resolution order: absolute/relative path with a separator, then a
//! PATH walk, then a fixed list of common install directories, then a
//! probe of npm's global bin directory for the usual Node/uv launchers.
//! The npm probe shells out, so it runs through `tokio::process` instead
//! of blocking the scheduler.

use crate::errors::StructuredError;
use std::env;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, trace};

/// Commands whose global npm bin directory is worth probing when the
/// usual lookups fail.
const PACKAGE_MANAGER_COMMANDS: &[&str] = &["node", "npm", "npx", "uv", "uvx"];

const COMMON_INSTALL_DIRS: &[&str] = &[
    "/usr/local/bin",
    "/usr/bin",
    "/opt/homebrew/bin",
    "~/.nvm/current/bin",
    "~/.npm-global/bin",
    "~/.local/bin",
];

/// Resolve `command` to an executable path, or fail with
/// `COMMAND_NOT_FOUND` carrying the searched PATH entries.
pub async fn resolve_command(command: &str) -> Result<PathBuf, StructuredError> {
    if command.trim().is_empty() {
        return Err(StructuredError::command_not_found(command, path_entries()));
    }

    // A command containing a separator is taken as a path, not a name.
    if command.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(command);
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        return Err(StructuredError::command_not_found(command, path_entries()));
    }

    if let Some(path) = search_path(command) {
        trace!(command, path = %path.display(), "Resolved command via PATH");
        return Ok(path);
    }

    if let Some(path) = search_common_dirs(command) {
        trace!(command, path = %path.display(), "Resolved command via common install dirs");
        return Ok(path);
    }

    if PACKAGE_MANAGER_COMMANDS.contains(&command) {
        if let Some(path) = search_npm_global_bin(command).await {
            debug!(command, path = %path.display(), "Resolved command via npm global bin");
            return Ok(path);
        }
    }

    Err(StructuredError::command_not_found(command, path_entries()))
}

fn path_entries() -> Vec<String> {
    env::var_os("PATH")
        .map(|paths| {
            env::split_paths(&paths)
                .map(|p| p.to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

fn search_path(command: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable(candidate))
}

fn search_common_dirs(command: &str) -> Option<PathBuf> {
    COMMON_INSTALL_DIRS
        .iter()
        .map(|dir| PathBuf::from(shellexpand::tilde(dir).into_owned()).join(command))
        .find(|candidate| is_executable(candidate))
}

async fn search_npm_global_bin(command: &str) -> Option<PathBuf> {
    let npm = search_path("npm")?;
    let output = Command::new(npm).args(["bin", "-g"]).output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let global_bin = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if global_bin.is_empty() {
        return None;
    }
    let candidate = PathBuf::from(global_bin).join(command);
    is_executable(&candidate).then_some(candidate)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
