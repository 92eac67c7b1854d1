use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Shells tried, in order, when nothing better is configured.
const DEFAULT_SHELLS: [&str; 2] = ["/system/bin/sh", "/bin/sh"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellCapability {
    pub path: PathBuf,
    pub present: bool,
    pub executable: bool,
}

// Basic executable check (this is platform-specific and simplified)
pub fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        let path_lower = path.to_string_lossy().to_lowercase();
        path.is_file() && (path_lower.ends_with(".exe") || path_lower.ends_with(".bat") || path_lower.ends_with(".cmd"))
    }
}

/// Set rwxr-xr-x through the permission-bit API.
pub fn set_executable_mode(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Same as `set_executable_mode` but through an external `chmod`, which some
/// sandboxes honour when the syscall path is filtered.
pub fn chmod_external(path: &Path) -> Result<(), String> {
    if cfg!(windows) {
        return Ok(());
    }

    let chmod = resolve_program("chmod").unwrap_or_else(|| PathBuf::from("chmod"));
    let output = Command::new(chmod)
        .arg("755")
        .arg(path)
        .output()
        .map_err(|e| format!("Failed to run chmod: {}", e))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "chmod exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Look a program up in PATH, or accept it as-is if it is already a path.
pub fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.is_absolute() {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    which::which(program).ok()
}

pub fn check_command_in_path(command: &str) -> bool {
    which::which(command).is_ok()
}

/// First shell that exists on this system.
pub fn default_shell() -> PathBuf {
    DEFAULT_SHELLS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .or_else(|| resolve_program("sh"))
        .unwrap_or_else(|| PathBuf::from("sh"))
}

/// Shell script that replaces the shell with the agent: `exec '<binary>' -c '<config>'`.
pub fn exec_script(binary: &Path, config: &Path) -> String {
    let binary = binary.to_string_lossy();
    let config = config.to_string_lossy();
    format!("exec {}", shell_words::join([binary.as_ref(), "-c", config.as_ref()]))
}

pub fn probe_shells(paths: &[PathBuf]) -> Vec<ShellCapability> {
    paths
        .iter()
        .map(|path| ShellCapability {
            path: path.clone(),
            present: path.exists(),
            executable: is_executable(path),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_script_quotes_paths() {
        let script = exec_script(Path::new("/data/my agent/frpc"), Path::new("/data/frpc.ini"));
        assert_eq!(script, "exec '/data/my agent/frpc' -c /data/frpc.ini");
    }

    #[cfg(unix)]
    #[test]
    fn test_permission_helpers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("agent");
        std::fs::write(&file, b"#!/bin/sh\n").unwrap();
        assert!(!is_executable(&file));

        set_executable_mode(&file).unwrap();
        assert!(is_executable(&file));

        assert!(chmod_external(&file).is_ok());
        assert!(!is_executable(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn test_default_shell_exists() {
        assert!(default_shell().exists());
        assert!(resolve_program("sh").is_some());
        assert!(resolve_program("/definitely/not/here").is_none());
    }

    #[test]
    fn test_probe_shells_reports_missing() {
        let caps = probe_shells(&[PathBuf::from("/definitely/not/a/shell")]);
        assert_eq!(caps.len(), 1);
        assert!(!caps[0].present);
        assert!(!caps[0].executable);
    }
}
