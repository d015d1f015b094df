//! Container identity.

use crate::arch::Arch;
use crate::error::ContainerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    Ubuntu,
    Debian,
    Fedora,
    Osx,
}

impl Distro {
    pub const ALL: [Distro; 4] = [Distro::Ubuntu, Distro::Debian, Distro::Fedora, Distro::Osx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Distro::Ubuntu => "ubuntu",
            Distro::Debian => "debian",
            Distro::Fedora => "fedora",
            Distro::Osx => "osx",
        }
    }

    /// Whether this distro is a Linux userland that proot can host.
    pub fn is_linux(&self) -> bool {
        !matches!(self, Distro::Osx)
    }
}

impl FromStr for Distro {
    type Err = ContainerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "ubuntu" => Ok(Distro::Ubuntu),
            "debian" => Ok(Distro::Debian),
            "fedora" => Ok(Distro::Fedora),
            "osx" | "macos" => Ok(Distro::Osx),
            other => {
                let known: Vec<&str> = Distro::ALL.iter().map(Distro::as_str).collect();
                Err(ContainerError::Configuration(format!(
                    "unknown distribution '{other}' (expected one of {})",
                    known.join(", ")
                )))
            }
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How packages reach the container root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Installation {
    /// Inside the root through proot, optionally under qemu.
    Proot,
    /// Alongside the root with the host's tools and redirected prefixes.
    Local,
}

/// Identifies one sandbox. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerSpec {
    distro: Distro,
    release: String,
    arch: Arch,
}

impl ContainerSpec {
    pub fn new(distro: Distro, release: impl Into<String>, arch: Arch) -> Result<Self, ContainerError> {
        let release = release.into().trim().to_lowercase();
        if release.is_empty() {
            return Err(ContainerError::Configuration(
                "release must not be empty".to_string(),
            ));
        }
        if release
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
        {
            return Err(ContainerError::Configuration(format!(
                "release '{release}' contains characters not allowed in a directory name"
            )));
        }
        Ok(Self {
            distro,
            release,
            arch,
        })
    }

    pub fn distro(&self) -> Distro {
        self.distro
    }

    pub fn release(&self) -> &str {
        &self.release
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Deterministic directory name, e.g. `ubuntu-precise-x86_64`.
    pub fn dir_name(&self) -> String {
        format!(
            "{}-{}-{}",
            self.distro.as_str(),
            self.release,
            self.arch.universal()
        )
    }
}

impl fmt::Display for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.distro, self.release, self.arch)
    }
}
