//! Role catalog: tool sets installed into a sandbox right after it boots.
//!
//! A role only names distribution packages. The setup script detects the
//! guest's package manager at run time, so one catalog serves every image.

use crate::error::{Result, SandboxError};

/// Role that installs nothing.
pub const BAREBONE: &str = "barebone";

/// One entry of the role catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Role {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub packages: &'static [&'static str],
}

const CATALOG: &[Role] = &[
    Role {
        id: BAREBONE,
        name: "Barebone",
        description: "Base image as-is, no setup.",
        packages: &[],
    },
    Role {
        id: "standard",
        name: "Standard",
        description: "Shell with the everyday command line tools.",
        packages: &["zsh", "git", "curl", "wget", "vim", "nano", "htop", "jq"],
    },
    Role {
        id: "node",
        name: "Node.js",
        description: "Node.js toolchain.",
        packages: &["zsh", "git", "curl", "nodejs", "npm"],
    },
    Role {
        id: "python",
        name: "Python",
        description: "Python 3 with pip and venv.",
        packages: &["zsh", "git", "curl", "python3", "python3-pip", "python3-venv"],
    },
    Role {
        id: "go",
        name: "Go",
        description: "Go toolchain.",
        packages: &["zsh", "git", "curl", "make", "golang"],
    },
    Role {
        id: "rust",
        name: "Rust",
        description: "Rust toolchain from the distribution.",
        packages: &["zsh", "git", "curl", "build-essential", "rustc", "cargo"],
    },
    Role {
        id: "devops",
        name: "DevOps",
        description: "Infrastructure tooling.",
        packages: &["zsh", "git", "curl", "ansible", "kubectl", "terraform"],
    },
];

pub fn catalog() -> &'static [Role] {
    CATALOG
}

pub fn find(id: &str) -> Option<&'static Role> {
    CATALOG.iter().find(|role| role.id == id)
}

/// Accept an empty role (no setup) or a catalog entry.
pub fn validate(id: &str) -> Result<()> {
    if id.is_empty() || find(id).is_some() {
        return Ok(());
    }
    Err(SandboxError::Validation(format!(
        "unknown role '{id}' (supported: {})",
        CATALOG.iter().map(|r| r.id).collect::<Vec<_>>().join(", ")
    )))
}

/// Command that installs the role's packages inside the sandbox, or `None`
/// when the role has nothing to install.
///
/// Packages missing from a distribution are skipped one by one so a single
/// unknown name does not abort the rest.
pub fn setup_command(id: &str) -> Result<Option<Vec<String>>> {
    validate(id)?;
    let Some(role) = find(id).filter(|role| !role.packages.is_empty()) else {
        return Ok(None);
    };
    Ok(Some(vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        setup_script(role),
    ]))
}

fn setup_script(role: &Role) -> String {
    let packages = role.packages.join(" ");
    format!(
        r#"set +e
if command -v apt-get >/dev/null 2>&1; then
    export DEBIAN_FRONTEND=noninteractive
    apt-get update -qq >/dev/null 2>&1
    add_pkg() {{ apt-get install -y -qq --no-install-recommends "$1" >/dev/null 2>&1; }}
elif command -v apk >/dev/null 2>&1; then
    add_pkg() {{ apk add --no-cache "$1" >/dev/null 2>&1; }}
elif command -v dnf >/dev/null 2>&1; then
    add_pkg() {{ dnf install -y -q "$1" >/dev/null 2>&1; }}
elif command -v yum >/dev/null 2>&1; then
    add_pkg() {{ yum install -y -q "$1" >/dev/null 2>&1; }}
elif command -v pacman >/dev/null 2>&1; then
    pacman -Sy --noconfirm >/dev/null 2>&1
    add_pkg() {{ pacman -S --noconfirm --needed "$1" >/dev/null 2>&1; }}
elif command -v zypper >/dev/null 2>&1; then
    add_pkg() {{ zypper -n -q install "$1" >/dev/null 2>&1; }}
else
    echo "no supported package manager" >&2
    exit 1
fi
installed=0
for pkg in {packages}; do
    if add_pkg "$pkg"; then installed=$((installed + 1)); else echo "skipped $pkg" >&2; fi
done
echo "role {id}: installed $installed packages"
"#,
        id = role.id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_are_unique() {
        let mut ids: Vec<_> = catalog().iter().map(|r| r.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), catalog().len());
    }

    #[test]
    fn empty_and_barebone_roles_need_no_setup() {
        assert_eq!(setup_command("").unwrap(), None);
        assert_eq!(setup_command(BAREBONE).unwrap(), None);
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = setup_command("wizard").unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
        assert!(err.to_string().contains("python"));
    }

    #[test]
    fn setup_installs_every_package_of_the_role() {
        let cmd = setup_command("python").unwrap().unwrap();
        assert_eq!(&cmd[..2], ["/bin/sh", "-c"]);
        let role = find("python").unwrap();
        assert!(cmd[2].contains(&format!("for pkg in {};", role.packages.join(" "))));
        assert!(cmd[2].contains("apk add"));
        assert!(cmd[2].contains("apt-get install"));
    }
}
