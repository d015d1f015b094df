//! Running commands inside a container.
//!
//! A [`Sandbox`] makes a container's root filesystem look like `/` to the
//! launched program. [`ProotSandbox`] does this with proot's syscall
//! interception (plus qemu for foreign architectures). [`PassthroughSandbox`]
//! is for hosts without interception: the program runs directly and finds
//! the container through environment redirection.
//!
//! [`Sandbox::run`] always resolves the program first, so a missing binary
//! fails before any bind mount or emulator is set up.

use crate::command_runner::{CommandOptions, CommandRunner};
use crate::error::ContainerError;
use crate::spec::ContainerSpec;
use nix::sys::signal::Signal;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use tracing::debug;

/// Guest directories searched for a bare program name, in order.
pub const GUEST_SEARCH_PATH: [&str; 6] = [
    "/usr/local/sbin",
    "/usr/local/bin",
    "/usr/sbin",
    "/usr/bin",
    "/sbin",
    "/bin",
];

const MAX_SYMLINK_HOPS: usize = 40;

const SYSTEM_BINDINGS: [&str; 5] = ["/dev", "/proc", "/sys", "/etc/resolv.conf", "/etc/hosts"];

/// A host path exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: PathBuf,
    pub guest: PathBuf,
}

impl BindMount {
    pub fn same(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host: path.clone(),
            guest: path,
        }
    }

    fn proot_arg(&self) -> String {
        if self.host == self.guest {
            self.host.display().to_string()
        } else {
            format!("{}:{}", self.host.display(), self.guest.display())
        }
    }
}

/// Temporary storage and the home directory, so build artifacts written
/// inside the sandbox survive on the host. Bound for every execution.
pub fn persistent_bindings() -> Vec<BindMount> {
    let mut bindings = vec![BindMount::same(std::env::temp_dir())];
    if let Some(home) = dirs::home_dir() {
        bindings.push(BindMount::same(home));
    }
    bindings
}

/// System paths plus [`persistent_bindings`].
pub fn default_bindings() -> Vec<BindMount> {
    SYSTEM_BINDINGS
        .iter()
        .map(|path| BindMount::same(*path))
        .chain(persistent_bindings())
        .collect()
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub spec: ContainerSpec,
    pub bindings: Vec<BindMount>,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(spec: ContainerSpec, argv: Vec<String>, env: Vec<(String, String)>) -> Self {
        Self {
            spec,
            bindings: default_bindings(),
            argv,
            env,
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    /// The child's exit code, or 128 + signal when it was killed.
    pub exit_code: i32,
    pub signaled: bool,
    pub signal: Option<i32>,
}

impl ExecutionResult {
    pub fn from_status(status: ExitStatus) -> Self {
        match status.signal() {
            Some(signal) => Self {
                exit_code: crate::error::exit_code::SIGNAL_BASE + signal,
                signaled: true,
                signal: Some(signal),
            },
            None => Self {
                exit_code: status.code().unwrap_or(1),
                signaled: false,
                signal: None,
            },
        }
    }

    pub fn success(&self) -> bool {
        !self.signaled && self.exit_code == 0
    }

    /// The exit code to report, or `AbnormalTermination` for a killed child.
    pub fn into_exit_code(self) -> Result<i32, ContainerError> {
        match self.signal {
            Some(signal) if self.signaled => Err(ContainerError::AbnormalTermination {
                signal,
                name: signal_name(signal),
            }),
            _ => Ok(self.exit_code),
        }
    }
}

pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {signal}"))
}

pub trait Sandbox {
    /// Host directory that appears as `/` to the program.
    fn root(&self) -> &Path;

    /// Finds the program to launch, as the path the launcher should be given.
    fn resolve_path(&self, program: &str) -> Result<PathBuf, ContainerError>;

    fn bind_mount(&mut self, binding: &BindMount) -> Result<(), ContainerError>;

    fn spawn(
        &self,
        program: &Path,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ContainerError>;

    /// Resolves, binds, then spawns and waits.
    fn run(&mut self, request: &ExecutionRequest) -> Result<ExecutionResult, ContainerError> {
        let program = request
            .argv
            .first()
            .ok_or_else(|| ContainerError::Configuration("no command given".to_string()))?;
        let resolved = self.resolve_path(program)?;

        for binding in request.bindings.iter().chain(persistent_bindings().iter()) {
            self.bind_mount(binding)?;
        }

        let result = self.spawn(&resolved, request)?;
        debug!(
            container = %request.spec.dir_name(),
            program = %program,
            exit_code = result.exit_code,
            signaled = result.signaled,
            "sandboxed command finished"
        );
        Ok(result)
    }
}

/// proot, optionally with a qemu user-mode emulator.
pub struct ProotSandbox {
    root: PathBuf,
    proot: PathBuf,
    emulator: Option<PathBuf>,
    bindings: Vec<BindMount>,
    runner: Arc<dyn CommandRunner>,
}

impl ProotSandbox {
    pub fn new(
        root: impl Into<PathBuf>,
        proot: impl Into<PathBuf>,
        emulator: Option<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            proot: proot.into(),
            emulator,
            bindings: Vec::new(),
            runner,
        }
    }

    pub fn bindings(&self) -> &[BindMount] {
        &self.bindings
    }

    /// proot arguments for launching `program` (a guest path).
    pub fn command_args(&self, program: &Path, request: &ExecutionRequest) -> Vec<String> {
        let mut args = vec![
            "-r".to_string(),
            self.root.display().to_string(),
            "-0".to_string(),
        ];
        if let Some(cwd) = &request.cwd {
            args.push("-w".to_string());
            args.push(cwd.display().to_string());
        }
        for binding in &self.bindings {
            args.push("-b".to_string());
            args.push(binding.proot_arg());
        }
        if let Some(emulator) = &self.emulator {
            args.push("-q".to_string());
            args.push(emulator.display().to_string());
        }
        args.push(program.display().to_string());
        args.extend(request.argv.iter().skip(1).cloned());
        args
    }
}

impl Sandbox for ProotSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, program: &str) -> Result<PathBuf, ContainerError> {
        let not_found = || ContainerError::ExecutableNotFound {
            program: program.to_string(),
            root: self.root.display().to_string(),
        };

        if program.contains('/') {
            let guest = Path::new(program);
            if guest.is_absolute() {
                if resolve_in_root(&self.root, guest).is_some() {
                    return Ok(guest.to_path_buf());
                }
                // Visible through a bind mount instead of the root itself.
                let bound = self
                    .bindings
                    .iter()
                    .chain(persistent_bindings().iter())
                    .any(|b| guest.starts_with(&b.guest))
                    && is_executable(guest);
                return if bound { Ok(guest.to_path_buf()) } else { Err(not_found()) };
            }
            return if is_executable(guest) {
                Ok(guest.to_path_buf())
            } else {
                Err(not_found())
            };
        }

        GUEST_SEARCH_PATH
            .iter()
            .map(|dir| Path::new(dir).join(program))
            .find(|guest| resolve_in_root(&self.root, guest).is_some())
            .ok_or_else(not_found)
    }

    fn bind_mount(&mut self, binding: &BindMount) -> Result<(), ContainerError> {
        if !binding.host.exists() {
            debug!(path = %binding.host.display(), "skipping bind of missing host path");
            return Ok(());
        }
        if !self.bindings.contains(binding) {
            self.bindings.push(binding.clone());
        }
        Ok(())
    }

    fn spawn(
        &self,
        program: &Path,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ContainerError> {
        let args = self.command_args(program, request);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let options = CommandOptions::with_env(request.env.clone());
        let proot = self.proot.display().to_string();
        let status = self.runner.run_status(&proot, &args, &options)?;
        Ok(ExecutionResult::from_status(status))
    }
}

/// Runs programs directly on the host with the container's environment overrides.
pub struct PassthroughSandbox {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl PassthroughSandbox {
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            root: root.into(),
            runner,
        }
    }
}

impl Sandbox for PassthroughSandbox {
    fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_path(&self, program: &str) -> Result<PathBuf, ContainerError> {
        let not_found = || ContainerError::ExecutableNotFound {
            program: program.to_string(),
            root: self.root.display().to_string(),
        };

        if program.contains('/') {
            let path = PathBuf::from(program);
            return if is_executable(&path) { Ok(path) } else { Err(not_found()) };
        }

        // Container prefixes first, then the host, mirroring the PATH the
        // child will see.
        GUEST_SEARCH_PATH
            .iter()
            .map(|dir| self.root.join(dir.trim_start_matches('/')))
            .chain(std::iter::once(self.root.join("bin")))
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
            .or_else(|| find_on_host(program, None))
            .ok_or_else(not_found)
    }

    fn bind_mount(&mut self, binding: &BindMount) -> Result<(), ContainerError> {
        // Host paths are already visible to a host process.
        debug!(path = %binding.host.display(), "bind mount is implicit in passthrough mode");
        Ok(())
    }

    fn spawn(
        &self,
        program: &Path,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, ContainerError> {
        let args: Vec<&str> = request.argv.iter().skip(1).map(String::as_str).collect();
        let options = CommandOptions {
            cwd: request.cwd.clone(),
            env: request.env.clone(),
        };
        let program = program.display().to_string();
        let status = self.runner.run_status(&program, &args, &options)?;
        Ok(ExecutionResult::from_status(status))
    }
}

/// Looks `program` up on a host search path, the process `PATH` when
/// `search_path` is `None`. Container prefixes are never consulted.
pub fn find_on_host(program: &str, search_path: Option<&OsStr>) -> Option<PathBuf> {
    let path = match search_path {
        Some(path) => path.to_os_string(),
        None => std::env::var_os("PATH")?,
    };
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

enum Step {
    Parent,
    Name(OsString),
}

fn steps_of(path: &Path) -> Vec<Step> {
    path.components()
        .filter_map(|component| match component {
            Component::ParentDir => Some(Step::Parent),
            Component::Normal(name) => Some(Step::Name(name.to_os_string())),
            _ => None,
        })
        .collect()
}

/// Follows `guest` inside `root`, treating absolute symlink targets as
/// relative to `root`. Returns the final guest path when it names an
/// executable file.
pub fn resolve_in_root(root: &Path, guest: &Path) -> Option<PathBuf> {
    let mut pending = steps_of(guest);
    pending.reverse();
    let mut resolved = PathBuf::from("/");
    let mut hops = 0;

    while let Some(step) = pending.pop() {
        match step {
            Step::Parent => {
                resolved.pop();
            }
            Step::Name(name) => {
                let candidate = resolved.join(&name);
                let on_host = host_path(root, &candidate);
                let meta = fs::symlink_metadata(&on_host).ok()?;
                if meta.file_type().is_symlink() {
                    hops += 1;
                    if hops > MAX_SYMLINK_HOPS {
                        return None;
                    }
                    let target = fs::read_link(&on_host).ok()?;
                    if target.is_absolute() {
                        resolved = PathBuf::from("/");
                    }
                    let mut target_steps = steps_of(&target);
                    target_steps.reverse();
                    pending.extend(target_steps);
                } else {
                    resolved = candidate;
                }
            }
        }
    }

    is_executable(&host_path(root, &resolved)).then_some(resolved)
}

fn host_path(root: &Path, guest: &Path) -> PathBuf {
    root.join(guest.strip_prefix("/").unwrap_or(guest))
}
