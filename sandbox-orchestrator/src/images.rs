//! Supported base images and custom image reference validation.

use crate::error::{Result, SandboxError};

/// Identifier that selects a caller-supplied image reference.
pub const CUSTOM: &str = "custom";

const CATALOG: &[(&str, &str)] = &[
    ("ubuntu", "ubuntu:24.04"),
    ("debian", "debian:12"),
    ("alpine", "alpine:3.21"),
    ("fedora", "fedora:41"),
    ("archlinux", "archlinux:latest"),
    ("kali", "kalilinux/kali-rolling:latest"),
    ("rocky", "rockylinux:9"),
    ("alma", "almalinux:9"),
    ("opensuse", "opensuse/leap:15.6"),
    ("centos", "quay.io/centos/centos:stream9"),
];

/// An image identifier resolved to an engine reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Identifier recorded on the sandbox (`ubuntu`, `custom:repo/img:tag`).
    pub id: String,
    /// Reference handed to the engine.
    pub reference: String,
    pub shell: &'static str,
    pub custom: bool,
}

pub fn is_supported(image: &str) -> bool {
    CATALOG.iter().any(|(id, _)| *id == image)
}

pub fn supported_images() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|(id, _)| *id)
}

/// Engine reference for a supported identifier.
pub fn reference(image: &str) -> Option<&'static str> {
    CATALOG
        .iter()
        .find(|(id, _)| *id == image)
        .map(|(_, reference)| *reference)
}

pub fn default_shell(image: &str) -> &'static str {
    if image == "alpine" || image.contains("alpine") {
        "/bin/sh"
    } else {
        "/bin/bash"
    }
}

/// Check that a custom reference is shaped like something an engine can pull.
pub fn validate_custom_reference(reference: &str) -> Result<()> {
    if reference.is_empty() {
        return Err(SandboxError::Validation("custom image reference is empty".into()));
    }
    if reference.chars().any(char::is_whitespace) {
        return Err(SandboxError::Validation(format!(
            "custom image reference '{reference}' contains whitespace"
        )));
    }
    if reference.contains("://") {
        return Err(SandboxError::Validation(format!(
            "custom image reference '{reference}' must not include a scheme"
        )));
    }
    if reference.starts_with(['/', ':', '@']) || reference.ends_with([':', '@', '/']) {
        return Err(SandboxError::Validation(format!(
            "malformed custom image reference '{reference}'"
        )));
    }
    Ok(())
}

/// Resolve an image identifier (plus the optional custom reference).
pub fn resolve(image: &str, custom_image: Option<&str>) -> Result<ResolvedImage> {
    let image = if image.is_empty() { "ubuntu" } else { image };

    if image == CUSTOM {
        let reference = custom_image
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                SandboxError::Validation("image 'custom' requires a custom image reference".into())
            })?;
        validate_custom_reference(reference)?;
        return Ok(ResolvedImage {
            id: format!("{CUSTOM}:{reference}"),
            reference: reference.to_string(),
            shell: default_shell(reference),
            custom: true,
        });
    }

    let reference = reference(image).ok_or_else(|| {
        SandboxError::Validation(format!(
            "unsupported image '{image}' (supported: {})",
            supported_images().collect::<Vec<_>>().join(", ")
        ))
    })?;
    Ok(ResolvedImage {
        id: image.to_string(),
        reference: reference.to_string(),
        shell: default_shell(image),
        custom: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_images_resolve() {
        let resolved = resolve("debian", None).unwrap();
        assert_eq!(resolved.reference, "debian:12");
        assert_eq!(resolved.shell, "/bin/bash");
        assert!(!resolved.custom);

        assert_eq!(resolve("alpine", None).unwrap().shell, "/bin/sh");
        assert_eq!(resolve("", None).unwrap().reference, "ubuntu:24.04");
    }

    #[test]
    fn unknown_image_is_rejected() {
        let err = resolve("windows", None).unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert!(err.to_string().contains("ubuntu"));
    }

    #[test]
    fn custom_image_requires_reference() {
        assert!(resolve(CUSTOM, None).is_err());
        assert!(resolve(CUSTOM, Some("  ")).is_err());

        let resolved = resolve(CUSTOM, Some("ghcr.io/acme/dev:1.2")).unwrap();
        assert_eq!(resolved.id, "custom:ghcr.io/acme/dev:1.2");
        assert_eq!(resolved.reference, "ghcr.io/acme/dev:1.2");
        assert!(resolved.custom);
    }

    #[test]
    fn custom_reference_shape() {
        for bad in ["", "has space", "https://evil/img", "/abs", "repo:", "@sha"] {
            assert!(validate_custom_reference(bad).is_err(), "{bad:?} should fail");
        }
        for good in ["nginx", "repo/img:tag", "registry:5000/a/b@sha256:abc"] {
            assert!(validate_custom_reference(good).is_ok(), "{good:?} should pass");
        }
    }
}
