//! Architecture naming and the emulation decision.
//!
//! Every architecture has three spellings: the Debian one used in Ubuntu and
//! Debian archive names (`amd64`, `armhf`), the universal one used for
//! directory names and OpenVZ templates (`x86_64`, `arm`), and the qemu one
//! that names the user-mode emulator binary (`qemu-x86_64`, `qemu-arm`).

use crate::error::ContainerError;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
    Ppc,
    Ppc64,
}

impl Arch {
    pub const ALL: [Arch; 6] = [
        Arch::X86,
        Arch::X86_64,
        Arch::Arm,
        Arch::Aarch64,
        Arch::Ppc,
        Arch::Ppc64,
    ];

    pub fn universal(&self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Aarch64 => "aarch64",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64",
        }
    }

    pub fn debian(&self) -> &'static str {
        match self {
            Arch::X86 => "i386",
            Arch::X86_64 => "amd64",
            Arch::Arm => "armhf",
            Arch::Aarch64 => "arm64",
            Arch::Ppc => "powerpc",
            Arch::Ppc64 => "ppc64el",
        }
    }

    pub fn qemu(&self) -> &'static str {
        match self {
            Arch::X86 => "i386",
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Aarch64 => "aarch64",
            Arch::Ppc => "ppc",
            Arch::Ppc64 => "ppc64le",
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            Arch::X86 | Arch::Arm | Arch::Ppc => 32,
            Arch::X86_64 | Arch::Aarch64 | Arch::Ppc64 => 64,
        }
    }

    /// The 32-bit sibling a 64-bit CPU of this family executes natively.
    pub fn narrow_variant(&self) -> Option<Arch> {
        match self {
            Arch::X86_64 => Some(Arch::X86),
            Arch::Aarch64 => Some(Arch::Arm),
            Arch::Ppc64 => Some(Arch::Ppc),
            _ => None,
        }
    }

    fn from_rust_target(value: &str) -> Option<Arch> {
        match value {
            "x86" => Some(Arch::X86),
            "x86_64" => Some(Arch::X86_64),
            "arm" => Some(Arch::Arm),
            "aarch64" => Some(Arch::Aarch64),
            "powerpc" => Some(Arch::Ppc),
            "powerpc64" => Some(Arch::Ppc64),
            _ => None,
        }
    }
}

impl FromStr for Arch {
    type Err = ContainerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let arch = match value.trim().to_lowercase().as_str() {
            "i386" | "i486" | "i586" | "i686" | "x86" => Arch::X86,
            "x86_64" | "amd64" => Arch::X86_64,
            "arm" | "armel" | "armhf" => Arch::Arm,
            "aarch64" | "arm64" => Arch::Aarch64,
            "powerpc" | "ppc" => Arch::Ppc,
            "ppc64el" | "ppc64" | "ppc64le" => Arch::Ppc64,
            other => {
                return Err(ContainerError::Configuration(format!(
                    "unknown architecture '{other}'"
                )))
            }
        };
        Ok(arch)
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.universal())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Os {
    Linux,
    MacOs,
    Windows,
    Unknown(String),
}

impl Os {
    pub fn as_str(&self) -> &str {
        match self {
            Os::Linux => "linux",
            Os::MacOs => "macos",
            Os::Windows => "windows",
            Os::Unknown(value) => value.as_str(),
        }
    }
}

/// The machine cibox itself runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub os: Os,
    pub arch: Arch,
    /// Native word width in bits.
    pub bits: u32,
}

impl Host {
    pub fn current() -> Result<Self, ContainerError> {
        let os = match std::env::consts::OS {
            "linux" => Os::Linux,
            "macos" => Os::MacOs,
            "windows" => Os::Windows,
            other => Os::Unknown(other.to_string()),
        };

        let arch = Arch::from_rust_target(std::env::consts::ARCH).ok_or_else(|| {
            ContainerError::Configuration(format!(
                "unsupported host architecture '{}'",
                std::env::consts::ARCH
            ))
        })?;

        Ok(Self {
            os,
            arch,
            bits: usize::BITS,
        })
    }

    pub fn linux(arch: Arch) -> Self {
        Self {
            os: Os::Linux,
            arch,
            bits: arch.bits(),
        }
    }

    /// Whether a syscall-interception sandbox can run here.
    pub fn supports_interception(&self) -> bool {
        self.os == Os::Linux
    }

    /// Whether `requested` binaries run on this host without an emulator.
    pub fn runs_natively(&self, requested: Arch) -> bool {
        requested == self.arch || self.arch.narrow_variant() == Some(requested)
    }
}

/// A user-mode CPU emulator vendored into a container directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emulator {
    /// File name of the emulator binary, e.g. `qemu-arm`.
    pub binary: String,
    pub target: Arch,
}

impl Emulator {
    fn for_arch(target: Arch) -> Self {
        Self {
            binary: format!("qemu-{}", target.qemu()),
            target,
        }
    }

    pub fn path_in(&self, container_dir: &Path) -> PathBuf {
        container_dir.join("bin").join(&self.binary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulationPlan {
    pub needs_emulation: bool,
    pub emulator: Option<Emulator>,
    pub target: Arch,
}

/// Decides whether `requested` needs an emulator on `host`.
///
/// Runs before any download so an impossible combination fails fast.
pub fn plan_emulation(requested: Arch, host: &Host) -> Result<EmulationPlan, ContainerError> {
    if requested.bits() > host.bits {
        return Err(ContainerError::UnsupportedEmulation {
            requested: requested.to_string(),
            host: host.arch.to_string(),
            reason: format!(
                "{}-bit guests cannot be emulated on a {}-bit host",
                requested.bits(),
                host.bits
            ),
        });
    }

    if host.runs_natively(requested) {
        return Ok(EmulationPlan {
            needs_emulation: false,
            emulator: None,
            target: requested,
        });
    }

    Ok(EmulationPlan {
        needs_emulation: true,
        emulator: Some(Emulator::for_arch(requested)),
        target: requested,
    })
}
