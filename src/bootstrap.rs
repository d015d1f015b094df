//! The bootstrap pipeline and container execution.
//!
//! A container moves through
//! `Empty → Downloading → Extracting → ConfiguringRepositories → InstallingPackages → Ready`.
//! Every build happens in a private staging directory with its own stage
//! journal and is published by renaming it into place, so a published
//! container is never modified or removed by a later `create`. Any error
//! drops the partial tree and journals `failed: <message>`; the next
//! `create` starts over.

use crate::arch::{plan_emulation, EmulationPlan, Host};
use crate::catalog::{Catalog, Integrity, RootfsImage};
use crate::command_runner::CommandRunner;
use crate::config::Settings;
use crate::download::{fetch_with_retry, Fetcher, RetryPolicy};
use crate::environment::EnvironmentOverrides;
use crate::error::ContainerError;
use crate::installer::{select_installer, InstallContext, PackageInstaller};
use crate::repository::{ContainerMetadata, ContainerState, StagingArea};
use crate::sandbox::{
    persistent_bindings, ExecutionRequest, ExecutionResult, PassthroughSandbox, ProotSandbox, Sandbox,
};
use crate::spec::{ContainerSpec, Installation};
use crate::templates::TemplateContext;
use cibox_common::archive::{detect_archive_type, extract_rootfs, install_binary, ArchiveType};
use cibox_common::checksum::{parse_checksum_file, verify_listed, verify_sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Directories pruned from Linux roots before they are cached.
const PRUNED_DIRS: [&str; 4] = [
    "var/lib/apt/lists",
    "usr/share/doc",
    "usr/share/man",
    "usr/share/locale",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The container was already ready; nothing ran.
    CacheHit { path: PathBuf },
    Bootstrapped {
        path: PathBuf,
        /// Repository placeholders that could not be substituted.
        warnings: Vec<String>,
    },
}

impl ProvisionOutcome {
    pub fn path(&self) -> &Path {
        match self {
            ProvisionOutcome::CacheHit { path } | ProvisionOutcome::Bootstrapped { path, .. } => path,
        }
    }
}

type StageObserver = Box<dyn Fn(&ContainerState) + Send + Sync>;

pub struct Provisioner {
    catalog: Catalog,
    fetcher: Arc<dyn Fetcher>,
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
    observer: Option<StageObserver>,
}

impl Provisioner {
    pub fn new(catalog: Catalog, fetcher: Arc<dyn Fetcher>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            catalog,
            fetcher,
            runner,
            retry: RetryPolicy::default(),
            observer: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Called as each stage starts, after it is journaled and before any
    /// command of that stage runs.
    pub fn on_stage(mut self, observer: impl Fn(&ContainerState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Makes the container in `settings` ready, bootstrapping it unless it already is.
    pub fn provision(&self, settings: &Settings) -> Result<ProvisionOutcome, ContainerError> {
        let spec = &settings.spec;
        let plan = plan_emulation(spec.arch(), &settings.host)?;
        ensure_mode_supports(settings.installation, &plan, &settings.host)?;

        let repository = settings.repository();
        let staging = repository.staging_for(spec);
        let image = self
            .catalog
            .image_for(spec, &settings.host, &staging.root_dir())?;
        let installer = select_installer(spec.distro(), settings.installation)?;

        let path = repository.path_for(spec);
        let state = repository.state(spec);
        if state.is_ready() {
            info!(container = %spec.dir_name(), "container is ready, skipping bootstrap");
            return Ok(ProvisionOutcome::CacheHit { path });
        }
        if state != ContainerState::Empty {
            info!(container = %spec.dir_name(), previous = %state, "found an unfinished bootstrap, building a fresh copy");
        }
        let swept = repository.sweep_abandoned(spec);
        if swept > 0 {
            debug!(container = %spec.dir_name(), swept, "removed abandoned builds");
        }
        staging.create()?;

        let result = self
            .bootstrap(settings, &staging, &plan, &image, installer.as_ref())
            .and_then(|warnings| {
                let metadata = ContainerMetadata::new(spec, settings.installation);
                if !repository.publish(spec, &staging, &metadata)? {
                    info!(container = %spec.dir_name(), "another bootstrap published first, using its tree");
                }
                Ok(warnings)
            });

        match result {
            Ok(warnings) => {
                info!(container = %spec.dir_name(), "container ready");
                Ok(ProvisionOutcome::Bootstrapped { path, warnings })
            }
            Err(err) => {
                staging.abandon(&err.to_string());
                Err(err)
            }
        }
    }

    fn enter(&self, staging: &StagingArea, state: ContainerState) -> Result<(), ContainerError> {
        staging.record_stage(&state)?;
        if let Some(observer) = &self.observer {
            observer(&state);
        }
        Ok(())
    }

    fn bootstrap(
        &self,
        settings: &Settings,
        staging: &StagingArea,
        plan: &EmulationPlan,
        image: &RootfsImage,
        installer: &dyn PackageInstaller,
    ) -> Result<Vec<String>, ContainerError> {
        let spec = &settings.spec;
        let dir = staging.path();

        self.enter(staging, ContainerState::Downloading)?;
        let archive = self.download_rootfs(image)?;
        if settings.installation == Installation::Proot {
            self.vendor_tools(settings, plan, dir)?;
        }

        self.enter(staging, ContainerState::Extracting)?;
        let archive_type = match detect_archive_type(image.file_name()) {
            ArchiveType::Raw => ArchiveType::TarGz,
            other => other,
        };
        let report = extract_rootfs(&archive, archive_type, &image.target, image.strip_components)
            .map_err(|e| ContainerError::Bootstrap(format!("cannot extract {}: {e}", image.url)))?;
        debug!(
            files = report.files,
            directories = report.directories,
            skipped_special = report.skipped_special,
            skipped_paths = report.skipped_paths,
            "extracted root filesystem"
        );

        self.enter(staging, ContainerState::ConfiguringRepositories)?;
        let context = TemplateContext {
            distro: spec.distro(),
            release: spec.release().to_string(),
            arch: spec.arch(),
        };
        let rendered = settings.repositories.render(&context);
        let prefix = staging.prefix_dir(spec, settings.installation);
        fs::create_dir_all(&prefix)?;
        let mut sandbox = open_sandbox(settings.installation, dir, &prefix, plan, self.runner.clone());
        let env = environment_for(settings.installation, &prefix, spec).resolve_from_process();
        let mut ctx = InstallContext {
            spec,
            root: &prefix,
            sandbox: sandbox.as_mut(),
            env,
            fetcher: self.fetcher.as_ref(),
            retry: &self.retry,
        };
        installer.prepare_root(&mut ctx)?;
        info!(container = %spec.dir_name(), installer = installer.name(), "configuring repositories");
        installer.configure_repositories(&mut ctx, &rendered)?;

        self.enter(staging, ContainerState::InstallingPackages)?;
        info!(container = %spec.dir_name(), packages = settings.packages.len(), "installing packages");
        installer.install_packages(&mut ctx, &settings.packages)?;

        if spec.distro().is_linux() {
            clean_caches(&image.target)?;
            if prefix != image.target {
                clean_caches(&prefix)?;
            }
        }
        Ok(rendered.warnings)
    }

    fn download_rootfs(&self, image: &RootfsImage) -> Result<Vec<u8>, ContainerError> {
        info!(url = %image.url, "downloading root filesystem");
        let data = fetch_with_retry(self.fetcher.as_ref(), &image.url, &self.retry)?;

        match &image.integrity {
            Some(Integrity::Sha256(expected)) => {
                verify_sha256(image.file_name(), &data, expected)?;
            }
            Some(Integrity::ChecksumFile(url)) => {
                let listing = fetch_with_retry(self.fetcher.as_ref(), url, &self.retry)?;
                let listing = parse_checksum_file(&String::from_utf8_lossy(&listing));
                verify_listed(&listing, image.file_name(), &data)?;
            }
            None => debug!(url = %image.url, "no integrity reference, skipping verification"),
        }
        Ok(data)
    }

    /// Fetches proot for the host and, when emulating, qemu for the target.
    fn vendor_tools(&self, settings: &Settings, plan: &EmulationPlan, dir: &Path) -> Result<(), ContainerError> {
        let proot_url = settings.tool_urls.proot_for(settings.host.arch);
        let proot = fetch_with_retry(self.fetcher.as_ref(), &proot_url, &self.retry)?;
        install_binary(&proot, &proot_url, &dir.join("bin").join("proot"))?;

        if let Some(emulator) = &plan.emulator {
            let qemu_url = settings.tool_urls.qemu_for(emulator.target);
            let qemu = fetch_with_retry(self.fetcher.as_ref(), &qemu_url, &self.retry)?;
            install_binary(&qemu, &qemu_url, &emulator.path_in(dir))?;
        }
        Ok(())
    }
}

/// Runs `argv` inside the ready container described by `settings`.
///
/// A container that is not ready is a configuration error and nothing is launched.
pub fn execute(
    settings: &Settings,
    runner: Arc<dyn CommandRunner>,
    argv: Vec<String>,
) -> Result<ExecutionResult, ContainerError> {
    let repository = settings.repository();
    let spec = &settings.spec;
    let dir = repository.locate(spec)?;
    let metadata = repository.read_metadata(spec)?;

    let plan = plan_emulation(spec.arch(), &settings.host)?;
    ensure_mode_supports(metadata.installation, &plan, &settings.host)?;

    let root = repository.prefix_dir(spec, metadata.installation);
    let mut sandbox = open_sandbox(metadata.installation, &dir, &root, &plan, runner);
    let env = environment_for(metadata.installation, &root, spec).resolve_from_process();
    let mut request = ExecutionRequest::new(spec.clone(), argv, env);
    if metadata.installation == Installation::Proot {
        request.cwd = visible_working_dir();
    }
    sandbox.run(&request)
}

fn ensure_mode_supports(installation: Installation, plan: &EmulationPlan, host: &Host) -> Result<(), ContainerError> {
    if installation == Installation::Local && plan.needs_emulation {
        return Err(ContainerError::UnsupportedEmulation {
            requested: plan.target.to_string(),
            host: host.arch.to_string(),
            reason: "local installation runs host binaries and cannot emulate".to_string(),
        });
    }
    Ok(())
}

fn open_sandbox(
    installation: Installation,
    dir: &Path,
    root: &Path,
    plan: &EmulationPlan,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn Sandbox> {
    match installation {
        Installation::Proot => Box::new(ProotSandbox::new(
            root,
            dir.join("bin").join("proot"),
            plan.emulator.as_ref().map(|emulator| emulator.path_in(dir)),
            runner,
        )),
        Installation::Local => Box::new(PassthroughSandbox::new(root, runner)),
    }
}

fn environment_for(installation: Installation, root: &Path, spec: &ContainerSpec) -> EnvironmentOverrides {
    match installation {
        Installation::Proot => EnvironmentOverrides::for_proot(root),
        Installation::Local => EnvironmentOverrides::for_local(root, spec.distro(), spec.arch()),
    }
}

/// The caller's directory, when a persistent binding makes it visible in the guest.
fn visible_working_dir() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    persistent_bindings()
        .iter()
        .any(|binding| cwd.starts_with(&binding.host))
        .then_some(cwd)
}

/// Drops package caches and docs that only bloat a persisted CI cache.
fn clean_caches(root: &Path) -> Result<(), ContainerError> {
    let archives = root.join("var/cache/apt/archives");
    if let Ok(entries) = fs::read_dir(&archives) {
        for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
            if path.extension().is_some_and(|ext| ext == "deb") {
                fs::remove_file(&path)?;
            }
        }
    }

    for dir in PRUNED_DIRS {
        let path = root.join(dir);
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        }
    }

    if let Ok(entries) = fs::read_dir(root.join("tmp")) {
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
    }

    if root.join("var/cache/apt").is_dir() {
        fs::create_dir_all(archives.join("partial"))?;
    }
    Ok(())
}
