use std::path::{Path, PathBuf};

use crate::error::{Result, SandboxError};

/// Directory of prebuilt ext4 root filesystems, one per image name.
#[derive(Clone, Debug)]
pub struct RootfsStore {
    dir: PathBuf,
}

impl RootfsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the rootfs for `image`. Errors if the name is unsafe or the file is missing.
    pub fn resolve(&self, image: &str) -> Result<PathBuf> {
        let image = if image.is_empty() { "ubuntu" } else { image };
        if image.contains(['/', '\\']) || image.starts_with('.') {
            return Err(SandboxError::Validation(format!(
                "invalid rootfs image name: {image}"
            )));
        }
        let path = self.dir.join(format!("{image}.ext4"));
        if !path.is_file() {
            return Err(SandboxError::Validation(format!(
                "no rootfs for image {image} at {}",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Image names with a rootfs present, sorted.
    pub fn available(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                (path.extension()? == "ext4")
                    .then(|| path.file_stem()?.to_str().map(str::to_string))
                    .flatten()
            })
            .collect();
        names.sort();
        names
    }
}
