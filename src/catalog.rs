//! Known distributions and where their root filesystems come from.

use crate::arch::{plan_emulation, Arch, Host, Os};
use crate::error::ContainerError;
use crate::spec::{ContainerSpec, Distro, Installation};
use std::path::{Path, PathBuf};

const OLD_UBUNTU_CORE: &str = "http://old-releases.ubuntu.com/releases/ubuntu-core/releases";
const OPENVZ_PRECREATED: &str = "http://download.openvz.org/template/precreated";

/// Which spelling of the architecture a URL template expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchNaming {
    Debian,
    Universal,
}

impl ArchNaming {
    pub fn name(&self, arch: Arch) -> &'static str {
        match self {
            ArchNaming::Debian => arch.debian(),
            ArchNaming::Universal => arch.universal(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchSupport {
    Listed(Vec<Arch>),
    /// Only whatever the host itself runs.
    HostOnly,
}

/// How a downloaded archive is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    /// A known hex SHA-256 digest.
    Sha256(String),
    /// URL of a `SHA256SUMS`-style listing that names the archive.
    ChecksumFile(String),
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub distro: Distro,
    pub release: String,
    /// Archive URL; `{arch}` is replaced using `arch_naming`.
    pub url_template: String,
    pub arch_naming: ArchNaming,
    pub archs: ArchSupport,
    pub integrity: Option<Integrity>,
    pub strip_components: u32,
    pub requires_os: Option<Os>,
    /// Installation mode this entry always uses, whatever was asked for.
    pub forced_installation: Option<Installation>,
}

impl CatalogEntry {
    fn linux(distro: Distro, release: &str, url_template: String, naming: ArchNaming, archs: &[Arch]) -> Self {
        Self {
            distro,
            release: release.to_string(),
            url_template,
            arch_naming: naming,
            archs: ArchSupport::Listed(archs.to_vec()),
            integrity: None,
            strip_components: 0,
            requires_os: None,
            forced_installation: None,
        }
    }

    fn with_integrity(mut self, integrity: Integrity) -> Self {
        self.integrity = Some(integrity);
        self
    }

    pub fn supports(&self, arch: Arch, host: &Host) -> bool {
        match &self.archs {
            ArchSupport::Listed(archs) => archs.contains(&arch),
            ArchSupport::HostOnly => arch == host.arch,
        }
    }

    pub fn available_on(&self, host: &Host) -> bool {
        match &self.requires_os {
            Some(os) => *os == host.os,
            None => true,
        }
    }

    /// Archs of this entry that can run on `host`, natively or emulated.
    pub fn usable_archs(&self, host: &Host) -> Vec<Arch> {
        let candidates = match &self.archs {
            ArchSupport::Listed(archs) => archs.clone(),
            ArchSupport::HostOnly => vec![host.arch],
        };
        candidates
            .into_iter()
            .filter(|arch| plan_emulation(*arch, host).is_ok())
            .collect()
    }

    fn render(&self, template: &str, arch: Arch) -> String {
        template.replace("{arch}", self.arch_naming.name(arch))
    }
}

/// A root filesystem archive resolved for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsImage {
    pub url: String,
    pub integrity: Option<Integrity>,
    pub strip_components: u32,
    /// Directory the archive is unpacked into.
    pub target: PathBuf,
}

impl RootfsImage {
    /// Last path segment of the URL, as it appears in checksum listings.
    pub fn file_name(&self) -> &str {
        self.url.rsplit('/').next().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn builtin() -> Self {
        let ubuntu_archs = [Arch::X86, Arch::X86_64, Arch::Arm];
        let openvz_archs = [Arch::X86, Arch::X86_64];

        let entries = vec![
            CatalogEntry::linux(
                Distro::Ubuntu,
                "precise",
                format!("{OLD_UBUNTU_CORE}/12.04.3/release/ubuntu-core-12.04.3-core-{{arch}}.tar.gz"),
                ArchNaming::Debian,
                &ubuntu_archs,
            )
            .with_integrity(Integrity::ChecksumFile(format!(
                "{OLD_UBUNTU_CORE}/12.04.3/release/SHA256SUMS"
            ))),
            CatalogEntry::linux(
                Distro::Ubuntu,
                "trusty",
                format!("{OLD_UBUNTU_CORE}/utopic/release/ubuntu-core-14.10-core-{{arch}}.tar.gz"),
                ArchNaming::Debian,
                &[Arch::X86, Arch::X86_64, Arch::Arm, Arch::Ppc],
            )
            .with_integrity(Integrity::ChecksumFile(format!(
                "{OLD_UBUNTU_CORE}/utopic/release/SHA256SUMS"
            ))),
            CatalogEntry::linux(
                Distro::Debian,
                "wheezy",
                format!("{OPENVZ_PRECREATED}/debian-7.0-{{arch}}-minimal.tar.gz"),
                ArchNaming::Universal,
                &openvz_archs,
            ),
            CatalogEntry::linux(
                Distro::Debian,
                "squeeze",
                format!("{OPENVZ_PRECREATED}/debian-6.0-{{arch}}-minimal.tar.gz"),
                ArchNaming::Universal,
                &openvz_archs,
            ),
            CatalogEntry::linux(
                Distro::Fedora,
                "20",
                format!("{OPENVZ_PRECREATED}/fedora-20-{{arch}}.tar.gz"),
                ArchNaming::Universal,
                &openvz_archs,
            ),
            CatalogEntry {
                distro: Distro::Osx,
                release: "homebrew".to_string(),
                url_template: "https://github.com/Homebrew/homebrew/tarball/master".to_string(),
                arch_naming: ArchNaming::Universal,
                archs: ArchSupport::HostOnly,
                integrity: None,
                strip_components: 1,
                requires_os: Some(Os::MacOs),
                forced_installation: Some(Installation::Local),
            },
        ];

        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn find(&self, distro: Distro, release: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|entry| entry.distro == distro && entry.release == release)
    }

    pub fn default_release(&self, distro: Distro) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.distro == distro)
            .map(|entry| entry.release.as_str())
    }

    /// Entries that can be created on `host`.
    pub fn available(&self, host: &Host) -> impl Iterator<Item = &CatalogEntry> + '_ {
        let host = host.clone();
        self.entries
            .iter()
            .filter(move |entry| entry.available_on(&host) && !entry.usable_archs(&host).is_empty())
    }

    /// Finds the entry for `spec` and checks it can be provisioned on `host`.
    pub fn entry_for(&self, spec: &ContainerSpec, host: &Host) -> Result<&CatalogEntry, ContainerError> {
        let entry = self.find(spec.distro(), spec.release()).ok_or_else(|| {
            ContainerError::Configuration(format!(
                "no matching distribution for {} {}",
                spec.distro(),
                spec.release()
            ))
        })?;

        if !entry.available_on(host) {
            return Err(ContainerError::Configuration(format!(
                "{} {} can only be created on {} hosts",
                spec.distro(),
                spec.release(),
                entry.requires_os.as_ref().map(Os::as_str).unwrap_or("other")
            )));
        }

        if !entry.supports(spec.arch(), host) {
            return Err(ContainerError::Configuration(format!(
                "no matching distribution for {} {} on {}",
                spec.distro(),
                spec.release(),
                spec.arch()
            )));
        }

        Ok(entry)
    }

    /// Resolves the archive for `spec`, to be unpacked into `target`.
    pub fn image_for(
        &self,
        spec: &ContainerSpec,
        host: &Host,
        target: &Path,
    ) -> Result<RootfsImage, ContainerError> {
        let entry = self.entry_for(spec, host)?;
        let integrity = entry.integrity.as_ref().map(|integrity| match integrity {
            Integrity::ChecksumFile(url) => Integrity::ChecksumFile(entry.render(url, spec.arch())),
            Integrity::Sha256(hex) => Integrity::Sha256(hex.clone()),
        });

        Ok(RootfsImage {
            url: entry.render(&entry.url_template, spec.arch()),
            integrity,
            strip_components: entry.strip_components,
            target: target.to_path_buf(),
        })
    }
}
