//! Resolved configuration for one invocation.
//!
//! clap already applies flag > environment precedence. [`Settings::resolve`]
//! fills in the defaults that depend on the host and the catalog, and returns
//! one immutable value. It reads nothing but the files it is pointed at.

use crate::arch::{Arch, Host, Os};
use crate::catalog::Catalog;
use crate::cli::{ContainerArgs, CreateArgs};
use crate::error::ContainerError;
use crate::repository::ContainerRepository;
use crate::spec::{ContainerSpec, Distro, Installation};
use crate::templates::{PackageList, RepositoryConfig};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PROOT_URL: &str = "http://static.proot.me/proot-{arch}";
pub const DEFAULT_QEMU_URL: &str =
    "https://github.com/multiarch/qemu-user-static/releases/download/v7.2.0-1/qemu-{arch}-static";

/// Where the vendored proot and qemu binaries come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUrls {
    /// `{arch}` is the host's universal arch name.
    pub proot: String,
    /// `{arch}` is the target's qemu arch name.
    pub qemu: String,
}

impl Default for ToolUrls {
    fn default() -> Self {
        Self {
            proot: DEFAULT_PROOT_URL.to_string(),
            qemu: DEFAULT_QEMU_URL.to_string(),
        }
    }
}

impl ToolUrls {
    pub fn with_overrides(proot: Option<&str>, qemu: Option<&str>) -> Self {
        let defaults = Self::default();
        Self {
            proot: proot.map(str::to_string).unwrap_or(defaults.proot),
            qemu: qemu.map(str::to_string).unwrap_or(defaults.qemu),
        }
    }

    pub fn proot_for(&self, host_arch: Arch) -> String {
        self.proot.replace("{arch}", host_arch.universal())
    }

    pub fn qemu_for(&self, target: Arch) -> String {
        self.qemu.replace("{arch}", target.qemu())
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Cache root holding one directory per container.
    pub container_dir: PathBuf,
    pub spec: ContainerSpec,
    pub installation: Installation,
    pub host: Host,
    pub repositories: RepositoryConfig,
    pub packages: PackageList,
    pub tool_urls: ToolUrls,
}

impl Settings {
    /// Builds settings identifying a container, with empty repository and package lists.
    pub fn resolve(args: &ContainerArgs, host: &Host, catalog: &Catalog) -> Result<Self, ContainerError> {
        let distro = match args.distro.as_deref() {
            Some(name) => name.parse::<Distro>()?,
            None if host.os == Os::MacOs => Distro::Osx,
            None => Distro::Ubuntu,
        };

        let release = match args.release.as_deref() {
            Some(release) => release.to_string(),
            None => catalog
                .default_release(distro)
                .map(str::to_string)
                .ok_or_else(|| {
                    ContainerError::Configuration(format!("no known releases for {distro}"))
                })?,
        };

        let arch = match args.arch.as_deref() {
            Some(name) => name.parse::<Arch>()?,
            None => host.arch,
        };

        let spec = ContainerSpec::new(distro, release, arch)?;

        let forced = catalog
            .find(spec.distro(), spec.release())
            .and_then(|entry| entry.forced_installation);
        let installation = match forced {
            Some(installation) => installation,
            None if args.local || !host.supports_interception() => Installation::Local,
            None => Installation::Proot,
        };

        Ok(Self {
            container_dir: absolute_dir(&args.container_dir)?,
            spec,
            installation,
            host: host.clone(),
            repositories: RepositoryConfig::default(),
            packages: PackageList::default(),
            tool_urls: ToolUrls::default(),
        })
    }

    /// Settings for `create`: also loads the repository and package files.
    pub fn for_create(args: &CreateArgs, host: &Host, catalog: &Catalog) -> Result<Self, ContainerError> {
        let mut settings = Self::resolve(&args.container, host, catalog)?;
        if let Some(path) = &args.repositories {
            settings.repositories = RepositoryConfig::from_file(path)?;
        }
        if let Some(path) = &args.packages {
            settings.packages = PackageList::from_file(path)?;
        }
        settings.tool_urls =
            ToolUrls::with_overrides(args.proot_url.as_deref(), args.qemu_url.as_deref());
        Ok(settings)
    }

    pub fn repository(&self) -> ContainerRepository {
        ContainerRepository::new(&self.container_dir)
    }
}

fn absolute_dir(dir: &Path) -> Result<PathBuf, ContainerError> {
    if dir.as_os_str().is_empty() {
        return Err(ContainerError::Configuration(
            "container directory must not be empty".to_string(),
        ));
    }
    match fs::canonicalize(dir) {
        Ok(path) => Ok(path),
        Err(_) => Ok(std::path::absolute(dir)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use serial_test::serial;
    use tempfile::TempDir;

    fn args(dir: &Path) -> ContainerArgs {
        ContainerArgs {
            container_dir: dir.to_path_buf(),
            distro: None,
            release: None,
            arch: None,
            local: false,
        }
    }

    #[test]
    fn defaults_follow_host_and_catalog() {
        let temp = TempDir::new().unwrap();
        let host = Host::linux(Arch::X86_64);
        let settings = Settings::resolve(&args(temp.path()), &host, &Catalog::builtin()).unwrap();

        assert_eq!(settings.spec.distro(), Distro::Ubuntu);
        assert_eq!(settings.spec.release(), "precise");
        assert_eq!(settings.spec.arch(), Arch::X86_64);
        assert_eq!(settings.installation, Installation::Proot);
        assert!(settings.container_dir.is_absolute());
        assert!(settings.packages.is_empty());
    }

    #[test]
    fn local_flag_and_forced_entries_pick_local_mode() {
        let temp = TempDir::new().unwrap();
        let host = Host::linux(Arch::X86_64);
        let mut local = args(temp.path());
        local.local = true;
        let settings = Settings::resolve(&local, &host, &Catalog::builtin()).unwrap();
        assert_eq!(settings.installation, Installation::Local);

        let mac = Host {
            os: Os::MacOs,
            arch: Arch::X86_64,
            bits: 64,
        };
        let settings = Settings::resolve(&args(temp.path()), &mac, &Catalog::builtin()).unwrap();
        assert_eq!(settings.spec.distro(), Distro::Osx);
        assert_eq!(settings.installation, Installation::Local);
    }

    #[test]
    fn bad_values_are_configuration_errors() {
        let temp = TempDir::new().unwrap();
        let host = Host::linux(Arch::X86_64);
        let mut bad = args(temp.path());
        bad.arch = Some("sparc".to_string());
        let err = Settings::resolve(&bad, &host, &Catalog::builtin()).unwrap_err();
        assert!(matches!(err, ContainerError::Configuration(_)));

        let mut bad = args(temp.path());
        bad.distro = Some("gentoo".to_string());
        let err = Settings::resolve(&bad, &host, &Catalog::builtin()).unwrap_err();
        assert!(err.is_caller_error());
    }

    #[test]
    fn tool_urls_use_each_arch_naming() {
        let urls = ToolUrls::default();
        assert_eq!(urls.proot_for(Arch::X86_64), "http://static.proot.me/proot-x86_64");
        assert!(urls.qemu_for(Arch::Ppc64).ends_with("/qemu-ppc64le-static"));

        let custom = ToolUrls::with_overrides(Some("http://mirror/proot-{arch}"), None);
        assert_eq!(custom.proot_for(Arch::Arm), "http://mirror/proot-arm");
        assert_eq!(custom.qemu, DEFAULT_QEMU_URL);
    }

    #[test]
    fn create_loads_lists_from_files() {
        let temp = TempDir::new().unwrap();
        let packages = temp.path().join("packages");
        let repositories = temp.path().join("repositories");
        fs::write(&packages, "build-essential\ncmake\n").unwrap();
        fs::write(&repositories, "{ubuntu} {release} universe\n").unwrap();

        let create = CreateArgs {
            container: args(temp.path()),
            repositories: Some(repositories),
            packages: Some(packages),
            proot_url: None,
            qemu_url: Some("http://q/{arch}".to_string()),
        };
        let settings =
            Settings::for_create(&create, &Host::linux(Arch::X86_64), &Catalog::builtin()).unwrap();
        assert_eq!(settings.packages.len(), 2);
        assert_eq!(settings.repositories.lines().len(), 1);
        assert_eq!(settings.tool_urls.qemu_for(Arch::Arm), "http://q/arm");
    }

    #[test]
    fn missing_package_file_is_a_configuration_error() {
        let temp = TempDir::new().unwrap();
        let create = CreateArgs {
            container: args(temp.path()),
            repositories: None,
            packages: Some(temp.path().join("nope")),
            proot_url: None,
            qemu_url: None,
        };
        let err = Settings::for_create(&create, &Host::linux(Arch::X86_64), &Catalog::builtin())
            .unwrap_err();
        assert!(matches!(err, ContainerError::Configuration(_)));
    }

    #[test]
    #[serial]
    fn environment_fills_in_missing_flags() {
        std::env::set_var("CONTAINER_DISTRO", "debian");
        std::env::set_var("CONTAINER_RELEASE", "squeeze");
        let cli = Cli::try_parse_from(["cibox", "status", "/tmp/cache", "--release", "wheezy"]);
        std::env::remove_var("CONTAINER_DISTRO");
        std::env::remove_var("CONTAINER_RELEASE");

        let Commands::Status(container) = cli.unwrap().command else {
            panic!("expected status");
        };
        let settings =
            Settings::resolve(&container, &Host::linux(Arch::X86_64), &Catalog::builtin()).unwrap();
        assert_eq!(settings.spec.distro(), Distro::Debian);
        assert_eq!(settings.spec.release(), "wheezy");
    }
}
