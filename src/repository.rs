//! On-disk container cache.
//!
//! Each [`ContainerSpec`] owns one published directory under the cache root:
//!
//! ```text
//! <cache>/ubuntu-precise-x86_64/
//!   root/          extracted root filesystem
//!   packages/      install prefix for local-mode Linux containers
//!   bin/           vendored proot and qemu-<arch>
//!   .cibox-ready   JSON metadata
//! ```
//!
//! A bootstrap never writes into that directory. It builds a private sibling,
//! `<name>.tmp-<pid>-<nanos>/`, journaling its stage in `.cibox-stage`, and
//! publishes it with a single rename once the ready marker is inside. A
//! published tree is therefore complete and is never removed by another
//! bootstrap.
//!
//! State is never held in memory between invocations. [`ContainerRepository::state`]
//! derives it from what is on disk every time, so a run killed half way leaves
//! a directory that reads as not ready.

use crate::error::ContainerError;
use crate::spec::{ContainerSpec, Installation};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const READY_MARKER: &str = ".cibox-ready";
pub const STAGE_JOURNAL: &str = ".cibox-stage";

const STAGING_INFIX: &str = ".tmp-";
const STALE_INFIX: &str = ".stale-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Empty,
    Downloading,
    Extracting,
    ConfiguringRepositories,
    InstallingPackages,
    Ready,
    Failed(String),
}

impl ContainerState {
    fn journal_line(&self) -> String {
        match self {
            ContainerState::Failed(message) => format!("failed: {message}"),
            other => other.to_string(),
        }
    }

    fn from_journal(line: &str) -> Self {
        let line = line.trim();
        if let Some(message) = line.strip_prefix("failed:") {
            return ContainerState::Failed(message.trim().to_string());
        }
        match line {
            "downloading" => ContainerState::Downloading,
            "extracting" => ContainerState::Extracting,
            "configuring-repositories" => ContainerState::ConfiguringRepositories,
            "installing-packages" => ContainerState::InstallingPackages,
            // A journal never records ready; treat junk as a fresh start.
            _ => ContainerState::Empty,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ContainerState::Ready)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::Empty => f.write_str("empty"),
            ContainerState::Downloading => f.write_str("downloading"),
            ContainerState::Extracting => f.write_str("extracting"),
            ContainerState::ConfiguringRepositories => f.write_str("configuring-repositories"),
            ContainerState::InstallingPackages => f.write_str("installing-packages"),
            ContainerState::Ready => f.write_str("ready"),
            ContainerState::Failed(message) => write!(f, "failed ({message})"),
        }
    }
}


/// Contents of the ready marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub distro: String,
    pub release: String,
    pub arch: String,
    pub installation: Installation,
    pub created_at: DateTime<Utc>,
}

impl ContainerMetadata {
    pub fn new(spec: &ContainerSpec, installation: Installation) -> Self {
        Self {
            distro: spec.distro().to_string(),
            release: spec.release().to_string(),
            arch: spec.arch().universal().to_string(),
            installation,
            created_at: Utc::now(),
        }
    }
}

/// Where packages land inside a container directory.
///
/// Local-mode Linux containers install into `packages/` with host tools;
/// everything else installs into the root filesystem itself.
pub fn prefix_in(dir: &Path, spec: &ContainerSpec, installation: Installation) -> PathBuf {
    if installation == Installation::Local && spec.distro().is_linux() {
        dir.join("packages")
    } else {
        dir.join("root")
    }
}

/// A private build directory next to the published one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn root_dir(&self) -> PathBuf {
        self.dir.join("root")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.dir.join("bin")
    }

    pub fn prefix_dir(&self, spec: &ContainerSpec, installation: Installation) -> PathBuf {
        prefix_in(&self.dir, spec, installation)
    }

    pub fn create(&self) -> Result<(), ContainerError> {
        fs::create_dir_all(&self.dir)?;
        debug!(path = %self.dir.display(), "created staging directory");
        Ok(())
    }

    /// Journals the stage this build has reached.
    pub fn record_stage(&self, state: &ContainerState) -> Result<(), ContainerError> {
        let line = format!("{}\n", state.journal_line());
        write_atomic(&self.dir.join(STAGE_JOURNAL), line.as_bytes())?;
        debug!(path = %self.dir.display(), stage = %state, "recorded stage");
        Ok(())
    }

    pub fn state(&self) -> ContainerState {
        match fs::read_to_string(self.dir.join(STAGE_JOURNAL)) {
            Ok(line) => ContainerState::from_journal(&line),
            Err(_) => ContainerState::Empty,
        }
    }

    /// Drops the partial tree and leaves only a `failed:` journal behind.
    pub fn abandon(&self, message: &str) {
        for sub in ["root", "packages", "bin"] {
            let path = self.dir.join(sub);
            if path.exists() {
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %e, "could not remove partial tree");
                }
            }
        }
        if let Err(e) = self.record_stage(&ContainerState::Failed(message.to_string())) {
            warn!(path = %self.dir.display(), error = %e, "could not journal failure");
        }
    }

    /// Writes the ready marker. The marker appears all at once or not at all.
    fn mark_ready(&self, metadata: &ContainerMetadata) -> Result<(), ContainerError> {
        let json = serde_json::to_vec_pretty(metadata)
            .map_err(|e| ContainerError::Bootstrap(format!("cannot encode metadata: {e}")))?;
        write_atomic(&self.dir.join(READY_MARKER), &json)?;
        remove_if_present(&self.dir.join(STAGE_JOURNAL))?;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        has_marker(&self.dir)
    }

    /// Process id and creation time encoded in the directory name.
    fn owner(&self, dir_name: &str) -> Option<(i32, u128)> {
        let name = self.dir.file_name()?.to_str()?;
        let rest = name.strip_prefix(dir_name)?.strip_prefix(STAGING_INFIX)?;
        let (pid, nanos) = rest.split_once('-')?;
        Some((pid.parse().ok()?, nanos.parse().ok()?))
    }
}

#[derive(Debug, Clone)]
pub struct ContainerRepository {
    base: PathBuf,
}

impl ContainerRepository {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn path_for(&self, spec: &ContainerSpec) -> PathBuf {
        self.base.join(spec.dir_name())
    }

    pub fn root_dir(&self, spec: &ContainerSpec) -> PathBuf {
        self.path_for(spec).join("root")
    }

    pub fn prefix_dir(&self, spec: &ContainerSpec, installation: Installation) -> PathBuf {
        prefix_in(&self.path_for(spec), spec, installation)
    }

    fn marker_path(&self, spec: &ContainerSpec) -> PathBuf {
        self.path_for(spec).join(READY_MARKER)
    }

    /// Derives the state of `spec` from disk.
    ///
    /// A published marker wins. Otherwise the newest build in progress (or
    /// the last failed one) reports its journaled stage.
    pub fn state(&self, spec: &ContainerSpec) -> ContainerState {
        if self.read_metadata(spec).is_ok() {
            return ContainerState::Ready;
        }
        let dir_name = spec.dir_name();
        self.staging_areas(spec)
            .into_iter()
            .filter_map(|staging| staging.owner(&dir_name).map(|(_, nanos)| (nanos, staging)))
            .max_by_key(|(nanos, _)| *nanos)
            .map(|(_, staging)| staging.state())
            .unwrap_or(ContainerState::Empty)
    }

    /// Returns the directory for `spec` when it is ready for use.
    pub fn locate(&self, spec: &ContainerSpec) -> Result<PathBuf, ContainerError> {
        match self.state(spec) {
            ContainerState::Ready => Ok(self.path_for(spec)),
            other => Err(ContainerError::Configuration(format!(
                "no ready container for {spec} in {} (state: {other}); run `cibox create` first",
                self.base.display()
            ))),
        }
    }

    pub fn read_metadata(&self, spec: &ContainerSpec) -> Result<ContainerMetadata, ContainerError> {
        let raw = fs::read_to_string(self.marker_path(spec))?;
        serde_json::from_str(&raw).map_err(|e| {
            ContainerError::Configuration(format!(
                "unreadable ready marker for {spec}: {e}"
            ))
        })
    }

    /// A fresh, not yet created, staging area for `spec`.
    pub fn staging_for(&self, spec: &ContainerSpec) -> StagingArea {
        StagingArea {
            dir: self.sibling(spec, STAGING_INFIX),
        }
    }

    /// Removes staging areas whose build failed or whose process is gone,
    /// and trees left aside by an interrupted publish.
    ///
    /// Returns how many directories were removed.
    pub fn sweep_abandoned(&self, spec: &ContainerSpec) -> usize {
        let dir_name = spec.dir_name();
        let mut removed = 0;

        for staging in self.staging_areas(spec) {
            let abandoned = match staging.owner(&dir_name) {
                Some((pid, _)) => {
                    matches!(staging.state(), ContainerState::Failed(_)) || !process_alive(pid)
                }
                None => false,
            };
            if abandoned && remove_tree(staging.path()) {
                removed += 1;
            }
        }

        let stale_prefix = format!("{dir_name}{STALE_INFIX}");
        for path in self.siblings(|name| name.starts_with(&stale_prefix)) {
            if remove_tree(&path) {
                removed += 1;
            }
        }
        removed
    }

    /// Marks `staging` ready and renames it into place.
    ///
    /// Returns `false` when another build published `spec` first; the
    /// staging area is then discarded and the published tree is left alone.
    pub fn publish(
        &self,
        spec: &ContainerSpec,
        staging: &StagingArea,
        metadata: &ContainerMetadata,
    ) -> Result<bool, ContainerError> {
        staging.mark_ready(metadata)?;
        let target = self.path_for(spec);

        if has_marker(&target) {
            info!(container = %spec.dir_name(), "already published by another build");
            remove_tree(staging.path());
            return Ok(false);
        }

        // A leftover tree without a marker (invalidated, or from an older
        // layout) is moved out of the way before it is deleted.
        if target.exists() {
            let aside = self.sibling(spec, STALE_INFIX);
            match fs::rename(&target, &aside) {
                Ok(()) if has_marker(&aside) => {
                    // Published between the check and the rename: put it back.
                    info!(container = %spec.dir_name(), "already published by another build");
                    if let Err(e) = fs::rename(&aside, &target) {
                        warn!(path = %aside.display(), error = %e, "could not restore published tree");
                    }
                    remove_tree(staging.path());
                    return Ok(false);
                }
                Ok(()) => {
                    remove_tree(&aside);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        match fs::rename(staging.path(), &target) {
            Ok(()) => {
                debug!(container = %spec.dir_name(), "published");
                Ok(true)
            }
            Err(_) if has_marker(&target) => {
                info!(container = %spec.dir_name(), "already published by another build");
                remove_tree(staging.path());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forces the next `create` to bootstrap again.
    ///
    /// Returns whether there was anything to invalidate.
    pub fn invalidate(&self, spec: &ContainerSpec, purge: bool) -> Result<bool, ContainerError> {
        let dir = self.path_for(spec);
        if !dir.exists() {
            return Ok(false);
        }

        let removed_marker = remove_if_present(&self.marker_path(spec))?;
        if purge {
            fs::remove_dir_all(&dir)?;
            return Ok(true);
        }
        Ok(removed_marker)
    }

    fn staging_areas(&self, spec: &ContainerSpec) -> Vec<StagingArea> {
        let prefix = format!("{}{STAGING_INFIX}", spec.dir_name());
        self.siblings(|name| name.starts_with(&prefix))
            .into_iter()
            .map(|dir| StagingArea { dir })
            .collect()
    }

    fn siblings(&self, matches: impl Fn(&str) -> bool) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.base) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|entry| entry.file_name().to_str().is_some_and(&matches))
            .map(|entry| entry.path())
            .collect()
    }

    fn sibling(&self, spec: &ContainerSpec, infix: &str) -> PathBuf {
        self.base
            .join(format!("{}{infix}{}", spec.dir_name(), unique_suffix()))
    }
}

fn unique_suffix() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{}-{nanos}", std::process::id())
}

fn has_marker(dir: &Path) -> bool {
    fs::read_to_string(dir.join(READY_MARKER))
        .ok()
        .and_then(|raw| serde_json::from_str::<ContainerMetadata>(&raw).ok())
        .is_some()
}

fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    !matches!(kill(Pid::from_raw(pid), None::<Signal>), Err(Errno::ESRCH))
}

fn remove_tree(path: &Path) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not remove directory");
            false
        }
    }
}

/// Writes `bytes` to a uniquely named sibling, syncs it, and renames it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!("{file_name}.tmp-{}", unique_suffix()));

    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp_path);
    })
}

fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::spec::Distro;
    use tempfile::TempDir;

    fn spec() -> ContainerSpec {
        ContainerSpec::new(Distro::Ubuntu, "precise", Arch::X86_64).unwrap()
    }

    fn metadata() -> ContainerMetadata {
        ContainerMetadata::new(&spec(), Installation::Proot)
    }

    /// A staging area whose root holds `usr/bin/<marker>`.
    fn built(repo: &ContainerRepository, marker: &str) -> StagingArea {
        let staging = repo.staging_for(&spec());
        staging.create().unwrap();
        let bin = staging.root_dir().join("usr/bin");
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join(marker), b"#!/bin/sh\n").unwrap();
        staging
    }

    fn leftovers(repo: &ContainerRepository) -> Vec<String> {
        fs::read_dir(&repo.base)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name != &spec().dir_name())
            .collect()
    }

    #[test]
    fn missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        assert_eq!(repo.state(&spec()), ContainerState::Empty);
        assert!(repo.locate(&spec()).is_err());
    }

    #[test]
    fn directory_without_marker_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        fs::create_dir_all(repo.root_dir(&spec()).join("usr/bin")).unwrap();
        assert_eq!(repo.state(&spec()), ContainerState::Empty);
    }

    #[test]
    fn staging_journal_drives_state() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        let staging = repo.staging_for(&spec());
        staging.create().unwrap();
        staging.record_stage(&ContainerState::Extracting).unwrap();
        assert_eq!(repo.state(&spec()), ContainerState::Extracting);

        staging.abandon("apt-get exited 100");
        assert_eq!(
            repo.state(&spec()),
            ContainerState::Failed("apt-get exited 100".into())
        );
        assert!(!staging.root_dir().exists());
    }

    #[test]
    fn publish_renames_staging_into_place() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        let staging = built(&repo, "gcc");
        staging.record_stage(&ContainerState::InstallingPackages).unwrap();

        assert!(repo.publish(&spec(), &staging, &metadata()).unwrap());

        assert_eq!(repo.state(&spec()), ContainerState::Ready);
        assert_eq!(repo.locate(&spec()).unwrap(), repo.path_for(&spec()));
        assert_eq!(repo.read_metadata(&spec()).unwrap(), metadata());
        assert!(repo.root_dir(&spec()).join("usr/bin/gcc").exists());
        assert!(!repo.path_for(&spec()).join(STAGE_JOURNAL).exists());
        assert!(!staging.path().exists());
        assert!(leftovers(&repo).is_empty());
    }

    #[test]
    fn second_publisher_leaves_the_published_tree_alone() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        let first = built(&repo, "first");
        let second = built(&repo, "second");

        assert!(repo.publish(&spec(), &first, &metadata()).unwrap());
        assert!(!repo.publish(&spec(), &second, &metadata()).unwrap());

        assert!(repo.root_dir(&spec()).join("usr/bin/first").exists());
        assert!(!repo.root_dir(&spec()).join("usr/bin/second").exists());
        assert!(leftovers(&repo).is_empty());
    }

    #[test]
    fn publish_replaces_an_invalidated_tree() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        fs::create_dir_all(repo.root_dir(&spec()).join("usr/bin")).unwrap();
        fs::write(repo.root_dir(&spec()).join("usr/bin/old"), b"x").unwrap();

        let staging = built(&repo, "new");
        assert!(repo.publish(&spec(), &staging, &metadata()).unwrap());

        assert!(repo.root_dir(&spec()).join("usr/bin/new").exists());
        assert!(!repo.root_dir(&spec()).join("usr/bin/old").exists());
        assert!(leftovers(&repo).is_empty());
    }

    #[test]
    fn sweep_keeps_live_builds_and_removes_dead_ones() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());

        let live = repo.staging_for(&spec());
        live.create().unwrap();
        live.record_stage(&ContainerState::InstallingPackages).unwrap();

        let failed = repo.staging_for(&spec());
        failed.create().unwrap();
        failed.abandon("boom");

        let orphan = StagingArea {
            dir: temp
                .path()
                .join(format!("{}{STAGING_INFIX}{}-1", spec().dir_name(), i32::MAX)),
        };
        orphan.create().unwrap();
        orphan.record_stage(&ContainerState::Downloading).unwrap();

        let stale = temp.path().join(format!("{}{STALE_INFIX}1-1", spec().dir_name()));
        fs::create_dir_all(&stale).unwrap();

        assert_eq!(repo.sweep_abandoned(&spec()), 3);
        assert!(live.path().exists());
        assert!(!failed.path().exists());
        assert!(!orphan.path().exists());
        assert!(!stale.exists());
    }

    #[test]
    fn sweep_ignores_other_specs() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        let other = ContainerSpec::new(Distro::Ubuntu, "precise", Arch::X86).unwrap();
        let staging = repo.staging_for(&other);
        staging.create().unwrap();
        staging.abandon("boom");

        assert_eq!(repo.sweep_abandoned(&spec()), 0);
        assert!(staging.path().exists());
    }

    #[test]
    fn truncated_marker_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        fs::create_dir_all(repo.path_for(&spec())).unwrap();
        fs::write(repo.path_for(&spec()).join(READY_MARKER), "{\"distro\":").unwrap();
        assert!(!repo.state(&spec()).is_ready());
    }

    #[test]
    fn local_linux_containers_install_into_a_separate_prefix() {
        let repo = ContainerRepository::new("/cache");
        assert_eq!(
            repo.prefix_dir(&spec(), Installation::Local),
            PathBuf::from("/cache/ubuntu-precise-x86_64/packages")
        );
        assert_eq!(
            repo.prefix_dir(&spec(), Installation::Proot),
            repo.root_dir(&spec())
        );
        let osx = ContainerSpec::new(Distro::Osx, "homebrew", Arch::X86_64).unwrap();
        assert_eq!(repo.prefix_dir(&osx, Installation::Local), repo.root_dir(&osx));
    }

    #[test]
    fn invalidate_removes_marker_or_tree() {
        let temp = TempDir::new().unwrap();
        let repo = ContainerRepository::new(temp.path());
        let staging = built(&repo, "gcc");
        repo.publish(&spec(), &staging, &metadata()).unwrap();

        assert!(repo.invalidate(&spec(), false).unwrap());
        assert!(!repo.state(&spec()).is_ready());
        assert!(repo.root_dir(&spec()).exists());

        let staging = built(&repo, "gcc");
        repo.publish(&spec(), &staging, &metadata()).unwrap();
        assert!(repo.invalidate(&spec(), true).unwrap());
        assert!(!repo.path_for(&spec()).exists());
        assert!(!repo.invalidate(&spec(), true).unwrap());
    }
}
