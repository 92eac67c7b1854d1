use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::config::write_atomically;
use crate::error::InstallError;
use crate::utils::command::{chmod_external, is_executable, set_executable_mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Arm64,
    Arm32,
    X86_64,
}

impl Architecture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Arm64 => "arm64",
            Architecture::Arm32 => "arm32",
            Architecture::X86_64 => "x86_64",
        }
    }

    /// Map an ABI/arch string to a bundled variant. Unknown strings fall back
    /// to arm64; the flag tells the caller a fallback happened.
    pub fn from_abi(abi: &str) -> (Architecture, bool) {
        let abi = abi.trim().to_lowercase();
        let arch = match abi.as_str() {
            "aarch64" | "arm64" | "arm64-v8a" | "armv8" | "armv8l" => Some(Architecture::Arm64),
            "arm" | "armv7" | "armv7l" | "armeabi-v7a" | "armeabi" | "arm32" => Some(Architecture::Arm32),
            "x86_64" | "amd64" | "x64" => Some(Architecture::X86_64),
            _ => None,
        };

        match arch {
            Some(arch) => (arch, false),
            None => {
                log::warn!("Unrecognized architecture '{}', falling back to arm64 agent", abi);
                (Architecture::Arm64, true)
            }
        }
    }

    pub fn detect() -> (Architecture, bool) {
        Self::from_abi(std::env::consts::ARCH)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of per-architecture agent bytes.
pub trait ArtifactStore: Send + Sync {
    fn read(&self, arch: Architecture) -> std::io::Result<Vec<u8>>;
}

/// Artifacts laid out as `<root>/frpc_<arch>/<binary_name>`.
pub struct DirectoryArtifactStore {
    root: PathBuf,
    binary_name: String,
}

impl DirectoryArtifactStore {
    pub fn new(root: PathBuf, binary_name: impl Into<String>) -> Self {
        Self {
            root,
            binary_name: binary_name.into(),
        }
    }

    pub fn artifact_path(&self, arch: Architecture) -> PathBuf {
        self.root
            .join(format!("frpc_{}", arch.as_str()))
            .join(&self.binary_name)
    }
}

impl ArtifactStore for DirectoryArtifactStore {
    fn read(&self, arch: Architecture) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.artifact_path(arch))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledBinary {
    pub path: PathBuf,
    pub mirror_path: Option<PathBuf>,
    pub architecture: Architecture,
    pub arch_fallback: bool,
    pub freshly_copied: bool,
}

pub struct BinaryInstaller {
    store: Arc<dyn ArtifactStore>,
    binary_name: String,
    mirror_dir: Option<PathBuf>,
    arch_override: Option<String>,
}

impl BinaryInstaller {
    pub fn new(store: Arc<dyn ArtifactStore>, binary_name: impl Into<String>, mirror_dir: Option<PathBuf>) -> Self {
        Self {
            store,
            binary_name: binary_name.into(),
            mirror_dir,
            arch_override: None,
        }
    }

    /// Use this ABI string instead of the compile-time architecture.
    pub fn with_arch_override(mut self, abi: impl Into<String>) -> Self {
        self.arch_override = Some(abi.into());
        self
    }

    pub fn architecture(&self) -> (Architecture, bool) {
        match &self.arch_override {
            Some(abi) => Architecture::from_abi(abi),
            None => Architecture::detect(),
        }
    }

    pub fn binary_path(&self, target_dir: &Path) -> PathBuf {
        target_dir.join(&self.binary_name)
    }

    /// Make sure an executable agent exists in `target_dir`. An existing file is never recopied.
    pub fn ensure_installed(&self, target_dir: &Path) -> Result<InstalledBinary, InstallError> {
        let (arch, arch_fallback) = self.architecture();
        let binary_path = self.binary_path(target_dir);

        let freshly_copied = if binary_path.exists() {
            log::debug!("Agent binary already present at {:?}", binary_path);
            if !is_executable(&binary_path) {
                self.fix_permissions(&binary_path);
            }
            false
        } else {
            let bytes = self.store.read(arch).map_err(|source| InstallError::SourceUnreadable {
                arch: arch.to_string(),
                source,
            })?;

            write_atomically(&binary_path, &bytes).map_err(|source| InstallError::DestinationUnwritable {
                path: binary_path.clone(),
                source,
            })?;

            self.fix_permissions(&binary_path);
            log::info!("Agent binary ({}) installed at: {:?}", arch, binary_path);
            true
        };

        let mirror_path = self.mirror_binary(&binary_path);

        Ok(InstalledBinary {
            path: binary_path,
            mirror_path,
            architecture: arch,
            arch_fallback,
            freshly_copied,
        })
    }

    /// Re-assert rwxr-xr-x through both the permission API and an external chmod.
    /// Returns true if the file ends up executable.
    pub fn fix_permissions(&self, path: &Path) -> bool {
        if let Err(e) = set_executable_mode(path) {
            log::warn!("Failed to set permissions on {:?}: {}", path, e);
        }

        if let Err(e) = chmod_external(path) {
            log::warn!("chmod command failed, relying on permission API: {}", e);
        }

        let executable = is_executable(path);
        if !executable {
            log::warn!("{:?} is still not executable after fixing permissions", path);
        }
        executable
    }

    /// Copy the binary into the mirror directory. Failures are logged, never fatal.
    pub fn mirror_binary(&self, binary_path: &Path) -> Option<PathBuf> {
        let mirror_dir = self.mirror_dir.as_ref()?;
        match mirror_file(binary_path, mirror_dir) {
            Ok(path) => {
                self.fix_permissions(&path);
                Some(path)
            }
            Err(e) => {
                log::warn!("Failed to mirror agent binary into {:?}: {}", mirror_dir, e);
                None
            }
        }
    }
}

/// Copy `source` into `dir`, keeping its file name.
pub(crate) fn mirror_file(source: &Path, dir: &Path) -> std::io::Result<PathBuf> {
    let file_name = source.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "source has no file name")
    })?;
    let target = dir.join(file_name);
    let bytes = std::fs::read(source)?;
    write_atomically(&target, &bytes)?;
    Ok(target)
}
