//! OS package manager invocations.
//!
//! The pipeline never resolves dependencies itself; it only knows which argv
//! asks a base image's package manager to refresh its index, install a set of
//! packages and purge the index cache afterwards.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Package ecosystem of a base image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManagerKind {
    /// Debian/Ubuntu `apt-get`.
    #[default]
    Apt,
    /// Alpine `apk`.
    Apk,
    /// Fedora/RHEL `dnf`.
    Dnf,
}

impl PackageManagerKind {
    /// Command that refreshes the package index, if the ecosystem needs one.
    #[must_use]
    pub fn refresh_argv(self) -> Option<Vec<String>> {
        match self {
            PackageManagerKind::Apt => Some(argv(["apt-get", "update"])),
            PackageManagerKind::Apk | PackageManagerKind::Dnf => None,
        }
    }

    /// Command that installs `packages`.
    #[must_use]
    pub fn install_argv(self, packages: &[String]) -> Vec<String> {
        let mut cmd = match self {
            PackageManagerKind::Apt => {
                argv(["apt-get", "install", "-y", "--no-install-recommends"])
            }
            PackageManagerKind::Apk => argv(["apk", "add"]),
            PackageManagerKind::Dnf => argv(["dnf", "install", "-y"]),
        };
        cmd.extend(packages.iter().cloned());
        cmd
    }

    /// Command that purges the package index cache.
    #[must_use]
    pub fn purge_argv(self) -> Vec<String> {
        match self {
            PackageManagerKind::Apt => argv(["rm", "-rf", "/var/lib/apt/lists"]),
            PackageManagerKind::Apk => argv(["rm", "-rf", "/var/cache/apk"]),
            PackageManagerKind::Dnf => argv(["dnf", "clean", "all"]),
        }
    }

    /// Directory holding the package index cache.
    #[must_use]
    pub fn index_cache_dir(self) -> &'static str {
        match self {
            PackageManagerKind::Apt => "/var/lib/apt/lists",
            PackageManagerKind::Apk => "/var/cache/apk",
            PackageManagerKind::Dnf => "/var/cache/dnf",
        }
    }
}

impl fmt::Display for PackageManagerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageManagerKind::Apt => "apt",
            PackageManagerKind::Apk => "apk",
            PackageManagerKind::Dnf => "dnf",
        })
    }
}

impl FromStr for PackageManagerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apt" | "apt-get" => Ok(PackageManagerKind::Apt),
            "apk" => Ok(PackageManagerKind::Apk),
            "dnf" | "yum" => Ok(PackageManagerKind::Dnf),
            other => Err(format!("unknown package manager '{other}'")),
        }
    }
}

fn argv<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}
