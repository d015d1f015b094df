//! Package manager adapters.
//!
//! One [`PackageInstaller`] is picked per container from its distro and
//! installation mode. Every step goes through the container's [`Sandbox`],
//! and success is judged by exit status alone.

use crate::download::{fetch_with_retry, Fetcher, RetryPolicy};
use crate::error::ContainerError;
use crate::minimize;
use crate::sandbox::{find_on_host, ExecutionRequest, ExecutionResult, Sandbox};
use crate::spec::{ContainerSpec, Distro, Installation};
use crate::templates::{PackageList, RenderedRepositories};
use cibox_common::archive::{detect_archive_type, extract_rootfs, ArchiveType};
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Everything an installer may touch while it works.
pub struct InstallContext<'a> {
    pub spec: &'a ContainerSpec,
    /// Host path packages are installed into: the root filesystem, or the
    /// separate prefix of a local-mode Linux container.
    pub root: &'a Path,
    pub sandbox: &'a mut dyn Sandbox,
    /// Environment for every package manager invocation.
    pub env: Vec<(String, String)>,
    pub fetcher: &'a dyn Fetcher,
    pub retry: &'a RetryPolicy,
}

impl InstallContext<'_> {
    fn run_step(&mut self, step: &str, argv: Vec<String>, extra_env: &[(&str, String)]) -> Result<(), ContainerError> {
        info!(container = %self.spec.dir_name(), step, command = %argv.join(" "), "running package step");
        let mut env = self.env.clone();
        for (key, value) in extra_env {
            env.retain(|(existing, _)| existing != key);
            env.push((key.to_string(), value.clone()));
        }

        let request = ExecutionRequest::new(self.spec.clone(), argv, env);
        let result = self.sandbox.run(&request).map_err(|err| match err {
            ContainerError::ExecutableNotFound { program, .. } => ContainerError::PackageInstall {
                step: step.to_string(),
                status: format!("{program} is not available"),
            },
            other => other,
        })?;

        if result.success() {
            Ok(())
        } else {
            Err(ContainerError::PackageInstall {
                step: step.to_string(),
                status: describe(&result),
            })
        }
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, ContainerError> {
        fetch_with_retry(self.fetcher, url, self.retry)
    }
}

fn describe(result: &ExecutionResult) -> String {
    match result.signal {
        Some(signal) if result.signaled => {
            format!("killed by {}", crate::sandbox::signal_name(signal))
        }
        _ => format!("exit code {}", result.exit_code),
    }
}

fn argv(parts: &[&str], rest: &[&str]) -> Vec<String> {
    parts
        .iter()
        .chain(rest.iter())
        .map(|part| part.to_string())
        .collect()
}

fn url_file_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("download")
        .to_string()
}

pub trait PackageInstaller {
    fn name(&self) -> &'static str;

    /// Runs once on the freshly extracted root, before repositories are added.
    fn prepare_root(&self, _ctx: &mut InstallContext<'_>) -> Result<(), ContainerError> {
        Ok(())
    }

    fn configure_repositories(
        &self,
        ctx: &mut InstallContext<'_>,
        repositories: &RenderedRepositories,
    ) -> Result<(), ContainerError>;

    fn install_packages(
        &self,
        ctx: &mut InstallContext<'_>,
        packages: &PackageList,
    ) -> Result<(), ContainerError>;
}

/// Picks the package manager for a container.
pub fn select_installer(
    distro: Distro,
    installation: Installation,
) -> Result<Box<dyn PackageInstaller>, ContainerError> {
    match (distro, installation) {
        (Distro::Ubuntu | Distro::Debian, Installation::Proot) => Ok(Box::new(Apt)),
        (Distro::Ubuntu | Distro::Debian, Installation::Local) => Ok(Box::new(AptLocal::default())),
        (Distro::Fedora, Installation::Proot) => Ok(Box::new(Yum)),
        (Distro::Fedora, Installation::Local) => Err(ContainerError::Configuration(
            "fedora containers cannot be installed locally".to_string(),
        )),
        (Distro::Osx, _) => Ok(Box::new(Brew)),
    }
}

/// Makes a repository line a valid sources.list entry.
pub fn apt_source_line(line: &str) -> String {
    if line.starts_with("deb ") || line.starts_with("deb-src ") {
        line.to_string()
    } else {
        format!("deb {line}")
    }
}

const APT_NONINTERACTIVE: (&str, &str) = ("DEBIAN_FRONTEND", "noninteractive");

/// apt-get inside the container through proot.
pub struct Apt;

impl PackageInstaller for Apt {
    fn name(&self) -> &'static str {
        "apt"
    }

    /// Purges Ubuntu packages outside the release's required set.
    fn prepare_root(&self, ctx: &mut InstallContext<'_>) -> Result<(), ContainerError> {
        if ctx.spec.distro() != Distro::Ubuntu {
            return Ok(());
        }
        let Some(required) = minimize::required_packages(ctx.spec.release()) else {
            debug!(release = ctx.spec.release(), "no required package set, keeping the full image");
            return Ok(());
        };

        let installed = minimize::installed_packages(ctx.root)?;
        let remove = minimize::removable(&installed, required);
        if remove.is_empty() {
            return Ok(());
        }
        info!(container = %ctx.spec.dir_name(), count = remove.len(), "minimizing root filesystem");
        let names: Vec<&str> = remove.iter().map(String::as_str).collect();
        let env: Vec<(&str, String)> = minimize::PURGE_ENV
            .iter()
            .map(|(key, value)| (*key, value.to_string()))
            .collect();
        ctx.run_step(
            "minimize root filesystem",
            argv(&["dpkg", "--purge", "--force-all"], &names),
            &env,
        )
    }

    fn configure_repositories(
        &self,
        ctx: &mut InstallContext<'_>,
        repositories: &RenderedRepositories,
    ) -> Result<(), ContainerError> {
        let sources = ctx.root.join("etc/apt/sources.list.d");
        fs::create_dir_all(&sources)?;
        for (index, line) in repositories.lines.iter().enumerate() {
            let path = sources.join(format!("cibox-{index}.list"));
            fs::write(&path, format!("{}\n", apt_source_line(line)))?;
        }

        let conf = ctx.root.join("etc/apt/apt.conf.d");
        fs::create_dir_all(&conf)?;
        fs::write(
            conf.join("99cibox"),
            "APT::Install-Recommends \"0\";\nAPT::Install-Suggests \"0\";\n",
        )?;
        Ok(())
    }

    fn install_packages(
        &self,
        ctx: &mut InstallContext<'_>,
        packages: &PackageList,
    ) -> Result<(), ContainerError> {
        if packages.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = packages.names().iter().map(String::as_str).collect();
        let env = [(APT_NONINTERACTIVE.0, APT_NONINTERACTIVE.1.to_string())];

        ctx.run_step(
            "update repositories",
            argv(&["apt-get", "update", "-y", "--force-yes"], &[]),
            &env,
        )?;
        ctx.run_step(
            "install packages",
            argv(&["apt-get", "install", "-y", "--force-yes"], &names),
            &env,
        )
    }
}

/// The host's apt-get, redirected into the container prefix, then the
/// host's `dpkg -x`.
///
/// Both tools are looked up on the host search path only. The container's
/// own copies are built for the guest and never run here.
#[derive(Debug, Default)]
pub struct AptLocal {
    search_path: Option<OsString>,
}

impl AptLocal {
    /// Looks host tools up on `search_path` instead of the process `PATH`.
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }

    fn host_tool(&self, program: &str) -> Result<String, ContainerError> {
        find_on_host(program, self.search_path.as_deref())
            .map(|path| path.display().to_string())
            .ok_or_else(|| ContainerError::PackageInstall {
                step: format!("locate {program}"),
                status: format!("{program} is not on the host PATH"),
            })
    }

    const DIRECTORIES: [&'static str; 9] = [
        "var/cache/apt/archives/partial",
        "var/lib/apt/lists/partial",
        "var/lib/dpkg/updates",
        "var/lib/dpkg/info",
        "var/lib/dpkg/parts",
        "etc/apt/apt.conf.d",
        "etc/apt/preferences.d",
        "etc/apt/trusted.gpg.d",
        "etc/apt/sources.list.d",
    ];

    pub fn config_path(root: &Path) -> PathBuf {
        root.join("etc/apt.conf")
    }

    fn archives(root: &Path) -> PathBuf {
        root.join("var/cache/apt/archives")
    }

    fn initialize(ctx: &InstallContext<'_>) -> Result<(), ContainerError> {
        let root = ctx.root;
        for dir in Self::DIRECTORIES {
            fs::create_dir_all(root.join(dir))?;
        }
        for file in ["var/lib/dpkg/status", "var/lib/dpkg/available"] {
            let path = root.join(file);
            if !path.exists() {
                fs::write(path, "")?;
            }
        }

        let r = root.display();
        let config = format!(
            "Apt {{\n    Architecture \"{arch}\";\n    Get {{\n        Assume-Yes true;\n    }};\n}};\n\
             debug {{\n    nolocking true;\n}};\n\
             Acquire::Queue-Mode \"host\";\n\
             Dir \"{r}\";\n\
             Dir::Cache \"{r}/var/cache/apt\";\n\
             Dir::State \"{r}/var/lib/apt\";\n\
             Dir::State::status \"{r}/var/lib/dpkg/status\";\n\
             Dir::Bin::Solvers \"{r}/usr/lib/apt/solvers\";\n\
             Dir::Bin::Planners \"{r}/usr/lib/apt/planners\";\n\
             Dir::Bin::Methods \"{r}/usr/lib/apt/methods\";\n\
             Dir::Bin::Dpkg \"{r}/usr/bin/dpkg.w\";\n\
             Dir::Etc \"{r}/etc/apt\";\n\
             Dir::Log \"{r}/var/log/apt\";\n",
            arch = ctx.spec.arch().debian(),
        );
        fs::write(Self::config_path(root), config)?;
        Ok(())
    }

    fn apt_env(root: &Path) -> [(&'static str, String); 1] {
        [("APT_CONFIG", Self::config_path(root).display().to_string())]
    }
}

impl PackageInstaller for AptLocal {
    fn name(&self) -> &'static str {
        "apt (local)"
    }

    fn configure_repositories(
        &self,
        ctx: &mut InstallContext<'_>,
        repositories: &RenderedRepositories,
    ) -> Result<(), ContainerError> {
        Self::initialize(ctx)?;

        let sources_list = ctx.root.join("etc/apt/sources.list");
        let mut lines: BTreeSet<String> = match fs::read_to_string(&sources_list) {
            Ok(existing) => existing
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        lines.extend(repositories.lines.iter().map(|line| apt_source_line(line)));

        let content: Vec<String> = lines.into_iter().collect();
        fs::write(&sources_list, format!("{}\n", content.join("\n")))?;
        Ok(())
    }

    fn install_packages(
        &self,
        ctx: &mut InstallContext<'_>,
        packages: &PackageList,
    ) -> Result<(), ContainerError> {
        Self::initialize(ctx)?;
        let root = ctx.root.to_path_buf();
        let env = Self::apt_env(&root);
        let apt_get = self.host_tool("apt-get")?;

        ctx.run_step(
            "update repositories",
            argv(&[apt_get.as_str(), "update", "-y", "--force-yes"], &[]),
            &env,
        )?;

        let archives = Self::archives(&root);
        if archives.exists() {
            fs::remove_dir_all(&archives)?;
        }
        fs::create_dir_all(archives.join("partial"))?;

        let (names, urls) = packages.partition_urls();
        for url in urls {
            let bytes = ctx.download(url)?;
            fs::write(archives.join(url_file_name(url)), bytes)?;
        }

        if !names.is_empty() {
            ctx.run_step(
                "download packages",
                argv(&[apt_get.as_str(), "-y", "--force-yes", "-d", "install", "--reinstall"], &names),
                &env,
            )?;
        }

        let mut debs: Vec<PathBuf> = fs::read_dir(&archives)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "deb"))
            .collect();
        debs.sort();

        if debs.is_empty() {
            return Ok(());
        }
        let dpkg = self.host_tool("dpkg")?;
        let root_arg = root.display().to_string();
        for deb in debs {
            let deb_arg = deb.display().to_string();
            ctx.run_step(
                "unpack package",
                argv(&[dpkg.as_str(), "-x", deb_arg.as_str(), root_arg.as_str()], &[]),
                &[],
            )?;
        }
        Ok(())
    }
}

/// yum inside a Fedora container through proot.
pub struct Yum;

impl PackageInstaller for Yum {
    fn name(&self) -> &'static str {
        "yum"
    }

    /// Each line is the URL of a `.repo` file.
    fn configure_repositories(
        &self,
        ctx: &mut InstallContext<'_>,
        repositories: &RenderedRepositories,
    ) -> Result<(), ContainerError> {
        if repositories.lines.is_empty() {
            return Ok(());
        }
        let repos_dir = ctx.root.join("etc/yum.repos.d");
        fs::create_dir_all(&repos_dir)?;
        for url in &repositories.lines {
            let bytes = ctx.download(url)?;
            fs::write(repos_dir.join(url_file_name(url)), bytes)?;
        }
        Ok(())
    }

    fn install_packages(
        &self,
        ctx: &mut InstallContext<'_>,
        packages: &PackageList,
    ) -> Result<(), ContainerError> {
        if packages.is_empty() {
            return Ok(());
        }
        let names: Vec<&str> = packages.names().iter().map(String::as_str).collect();
        ctx.run_step("install packages", argv(&["yum", "install", "-y"], &names), &[])
    }
}

/// The container's own Homebrew, run directly on a macOS host.
pub struct Brew;

impl PackageInstaller for Brew {
    fn name(&self) -> &'static str {
        "brew"
    }

    /// Each line is a tap.
    fn configure_repositories(
        &self,
        ctx: &mut InstallContext<'_>,
        repositories: &RenderedRepositories,
    ) -> Result<(), ContainerError> {
        for tap in &repositories.lines {
            ctx.run_step("add tap", argv(&["brew", "tap", tap.as_str()], &[]), &[])?;
        }
        Ok(())
    }

    fn install_packages(
        &self,
        ctx: &mut InstallContext<'_>,
        packages: &PackageList,
    ) -> Result<(), ContainerError> {
        let (names, urls) = packages.partition_urls();
        if !names.is_empty() {
            ctx.run_step("update repositories", argv(&["brew", "update"], &[]), &[])?;
            ctx.run_step("install packages", argv(&["brew", "install"], &names), &[])?;
        }

        for url in urls {
            let bytes = ctx.download(url)?;
            let archive_type = match detect_archive_type(&url_file_name(url)) {
                ArchiveType::Raw => ArchiveType::TarGz,
                other => other,
            };
            extract_rootfs(&bytes, archive_type, ctx.root, 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::command_runner::MockCommandRunner;
    use crate::download::FetchError;
    use crate::sandbox::PassthroughSandbox;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct NoNetwork;

    impl Fetcher for NoNetwork {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            Err(FetchError::Fatal(format!("offline: {url}")))
        }
    }

    /// Serves the same bytes for every URL.
    struct DebMirror;

    impl Fetcher for DebMirror {
        fn fetch(&self, _url: &str) -> Result<Vec<u8>, FetchError> {
            Ok(b"!<arch>\n".to_vec())
        }
    }

    struct Fixture {
        temp: TempDir,
        root: PathBuf,
        spec: ContainerSpec,
        runner: Arc<MockCommandRunner>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().join("root");
            fs::create_dir_all(&root).unwrap();
            Self {
                temp,
                root,
                spec: ContainerSpec::new(Distro::Ubuntu, "precise", Arch::X86_64).unwrap(),
                runner: Arc::new(MockCommandRunner::new()),
            }
        }

        fn root(&self) -> &Path {
            &self.root
        }

        /// A directory standing in for the host's PATH.
        fn host_bin(&self) -> PathBuf {
            self.temp.path().join("host-bin")
        }

        fn install_tools(&self, tools: &[&str]) {
            install_scripts(&self.root().join("usr/bin"), tools);
        }

        fn install_host_tools(&self, tools: &[&str]) {
            install_scripts(&self.host_bin(), tools);
        }
    }

    fn install_scripts(dir: &Path, tools: &[&str]) {
        use std::os::unix::fs::PermissionsExt;
        fs::create_dir_all(dir).unwrap();
        for tool in tools {
            let path = dir.join(tool);
            fs::write(&path, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    fn write_status(root: &Path, packages: &[&str]) {
        let dpkg = root.join("var/lib/dpkg");
        fs::create_dir_all(&dpkg).unwrap();
        let status: String = packages
            .iter()
            .map(|name| format!("Package: {name}\nStatus: install ok installed\n\n"))
            .collect();
        fs::write(dpkg.join("status"), status).unwrap();
    }

    fn rendered(lines: &[&str]) -> RenderedRepositories {
        RenderedRepositories {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            warnings: vec![],
        }
    }

    #[test]
    fn selects_variant_from_distro_and_mode() {
        assert_eq!(select_installer(Distro::Ubuntu, Installation::Proot).unwrap().name(), "apt");
        assert_eq!(select_installer(Distro::Debian, Installation::Local).unwrap().name(), "apt (local)");
        assert_eq!(select_installer(Distro::Fedora, Installation::Proot).unwrap().name(), "yum");
        assert_eq!(select_installer(Distro::Osx, Installation::Local).unwrap().name(), "brew");
        assert!(select_installer(Distro::Fedora, Installation::Local).is_err());
    }

    #[test]
    fn apt_source_lines_get_one_prefix() {
        assert_eq!(apt_source_line("http://x precise main"), "deb http://x precise main");
        assert_eq!(apt_source_line("deb http://x precise main"), "deb http://x precise main");
        assert_eq!(apt_source_line("deb-src http://x precise main"), "deb-src http://x precise main");
    }

    #[test]
    fn apt_writes_one_list_per_repository() {
        let fx = Fixture::new();
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &NoNetwork,
            retry: &RetryPolicy::immediate(),
        };

        Apt.configure_repositories(&mut ctx, &rendered(&["http://a precise main", "deb http://b precise main"]))
            .unwrap();

        let dir = fx.root().join("etc/apt/sources.list.d");
        assert_eq!(
            fs::read_to_string(dir.join("cibox-0.list")).unwrap(),
            "deb http://a precise main\n"
        );
        assert_eq!(
            fs::read_to_string(dir.join("cibox-1.list")).unwrap(),
            "deb http://b precise main\n"
        );
    }

    #[test]
    fn apt_runs_update_then_install() {
        let fx = Fixture::new();
        fx.install_tools(&["apt-get"]);
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &NoNetwork,
            retry: &RetryPolicy::immediate(),
        };

        Apt.install_packages(&mut ctx, &PackageList::parse("gcc\ncmake\n")).unwrap();

        let calls = fx.runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, vec!["update", "-y", "--force-yes"]);
        assert_eq!(calls[1].args, vec!["install", "-y", "--force-yes", "gcc", "cmake"]);
        assert!(calls[1]
            .options
            .env
            .contains(&("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())));
    }

    #[test]
    fn apt_failure_stops_at_first_step() {
        let fx = Fixture::new();
        fx.install_tools(&["apt-get"]);
        fx.runner.push_exit(100);
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &NoNetwork,
            retry: &RetryPolicy::immediate(),
        };

        let err = Apt.install_packages(&mut ctx, &PackageList::parse("gcc")).unwrap_err();
        match err {
            ContainerError::PackageInstall { step, status } => {
                assert_eq!(step, "update repositories");
                assert_eq!(status, "exit code 100");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.runner.call_count(), 1);
    }

    #[test]
    fn empty_package_list_runs_nothing() {
        let fx = Fixture::new();
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &NoNetwork,
            retry: &RetryPolicy::immediate(),
        };
        Apt.install_packages(&mut ctx, &PackageList::default()).unwrap();
        Yum.install_packages(&mut ctx, &PackageList::default()).unwrap();
        assert_eq!(fx.runner.call_count(), 0);
    }

    #[test]
    fn apt_local_runs_host_tools_against_the_prefix() {
        let fx = Fixture::new();
        // The guest's copies must not be picked up.
        fx.install_tools(&["apt-get", "dpkg"]);
        fx.install_host_tools(&["apt-get", "dpkg"]);
        let installer = AptLocal::with_search_path(fx.host_bin());
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &DebMirror,
            retry: &RetryPolicy::immediate(),
        };

        installer
            .configure_repositories(&mut ctx, &rendered(&["http://archive.ubuntu.com/ubuntu/ precise main"]))
            .unwrap();
        let config = fs::read_to_string(AptLocal::config_path(fx.root())).unwrap();
        assert!(config.contains("Architecture \"amd64\""));
        assert!(fs::read_to_string(fx.root().join("etc/apt/sources.list"))
            .unwrap()
            .contains("deb http://archive.ubuntu.com/ubuntu/ precise main"));

        installer
            .install_packages(&mut ctx, &PackageList::parse("zlib1g-dev\nhttp://debs.test/pkg_1.0_amd64.deb\n"))
            .unwrap();

        let calls = fx.runner.calls();
        assert_eq!(calls.len(), 3);
        let host_apt = fx.host_bin().join("apt-get").display().to_string();
        let host_dpkg = fx.host_bin().join("dpkg").display().to_string();
        assert_eq!(calls[0].program, host_apt);
        assert_eq!(calls[1].program, host_apt);
        assert_eq!(calls[1].args[..5], ["-y", "--force-yes", "-d", "install", "--reinstall"]);
        assert_eq!(calls[2].program, host_dpkg);
        assert_eq!(calls[2].args[0], "-x");
        assert!(calls[2].args[1].ends_with("var/cache/apt/archives/pkg_1.0_amd64.deb"));
        assert_eq!(calls[2].args[2], fx.root().display().to_string());

        let apt_config = AptLocal::config_path(fx.root()).display().to_string();
        assert!(calls[0]
            .options
            .env
            .contains(&("APT_CONFIG".to_string(), apt_config)));
    }

    #[test]
    fn apt_local_without_host_apt_fails_before_running_anything() {
        let fx = Fixture::new();
        fx.install_tools(&["apt-get"]);
        let installer = AptLocal::with_search_path(fx.host_bin());
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &NoNetwork,
            retry: &RetryPolicy::immediate(),
        };

        let err = installer.install_packages(&mut ctx, &PackageList::parse("gcc")).unwrap_err();
        assert!(matches!(err, ContainerError::PackageInstall { ref step, .. } if step == "locate apt-get"));
        assert_eq!(fx.runner.call_count(), 0);
    }

    #[test]
    fn ubuntu_root_is_minimized_before_repositories() {
        let fx = Fixture::new();
        fx.install_tools(&["dpkg"]);
        write_status(fx.root(), &["bash", "dpkg", "ubuntu-minimal", "vim-tiny"]);
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &NoNetwork,
            retry: &RetryPolicy::immediate(),
        };

        Apt.prepare_root(&mut ctx).unwrap();

        let calls = fx.runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args, vec!["--purge", "--force-all", "ubuntu-minimal", "vim-tiny"]);
        assert!(calls[0]
            .options
            .env
            .contains(&("SUDO_FORCE_REMOVE".to_string(), "yes".to_string())));
    }

    #[test]
    fn minimal_or_unknown_roots_are_left_alone() {
        let fx = Fixture::new();
        fx.install_tools(&["dpkg"]);
        write_status(fx.root(), &["bash", "dpkg"]);
        let debian = ContainerSpec::new(Distro::Debian, "wheezy", Arch::X86_64).unwrap();
        let xenial = ContainerSpec::new(Distro::Ubuntu, "xenial", Arch::X86_64).unwrap();

        for spec in [&fx.spec, &debian, &xenial] {
            let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
            let mut ctx = InstallContext {
                spec,
                root: fx.root(),
                sandbox: &mut sandbox,
                env: vec![],
                fetcher: &NoNetwork,
                retry: &RetryPolicy::immediate(),
            };
            Apt.prepare_root(&mut ctx).unwrap();
        }
        assert_eq!(fx.runner.call_count(), 0);
    }

    #[test]
    fn unreachable_repo_file_fails_yum_configuration() {
        let fx = Fixture::new();
        let mut sandbox = PassthroughSandbox::new(fx.root(), fx.runner.clone());
        let mut ctx = InstallContext {
            spec: &fx.spec,
            root: fx.root(),
            sandbox: &mut sandbox,
            env: vec![],
            fetcher: &NoNetwork,
            retry: &RetryPolicy::immediate(),
        };
        let err = Yum
            .configure_repositories(&mut ctx, &rendered(&["http://example.com/x.repo"]))
            .unwrap_err();
        assert!(matches!(err, ContainerError::Download { attempts: 1, .. }));
    }
}
