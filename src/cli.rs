//! CLI argument definitions for cibox.
//!
//! Kept out of `main.rs` so `config::Settings::resolve` and the integration
//! tests can build these types directly.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cibox")]
#[command(about = "Cached, unprivileged build containers for CI")]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create (or reuse) a container and install packages into it
    Create(CreateArgs),

    /// Run a command inside a ready container
    ///
    /// The command's exit code becomes cibox's exit code.
    Exec(ExecArgs),

    /// Print the root filesystem directory of a ready container
    Rootdir(ContainerArgs),

    /// Show the state of a container directory
    Status(ContainerArgs),

    /// Force the next `create` to bootstrap from scratch
    Invalidate(InvalidateArgs),

    /// List the distributions that can be created on this host
    Distros,
}

/// Identifies one container. Each option falls back to its environment variable.
#[derive(Debug, Clone, Args)]
pub struct ContainerArgs {
    /// Directory holding cached containers
    #[arg(value_name = "CONTAINER_DIRECTORY")]
    pub container_dir: PathBuf,

    /// Distribution (ubuntu, debian, fedora, osx)
    #[arg(long, env = "CONTAINER_DISTRO")]
    pub distro: Option<String>,

    /// Release, e.g. precise or wheezy (defaults to the first known release)
    #[arg(long, env = "CONTAINER_RELEASE")]
    pub release: Option<String>,

    /// Architecture (defaults to the host's)
    #[arg(long, env = "CONTAINER_ARCH")]
    pub arch: Option<String>,

    /// Install with host tools instead of inside proot
    #[arg(long)]
    pub local: bool,
}

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    #[command(flatten)]
    pub container: ContainerArgs,

    /// File with one repository line per line
    #[arg(long, value_name = "FILE")]
    pub repositories: Option<PathBuf>,

    /// File with one package name per line
    #[arg(long, value_name = "FILE")]
    pub packages: Option<PathBuf>,

    /// URL template for the static proot binary ({arch} = host arch)
    #[arg(long, env = "CIBOX_PROOT_URL", hide = true)]
    pub proot_url: Option<String>,

    /// URL template for static qemu user-mode binaries ({arch} = qemu arch)
    #[arg(long, env = "CIBOX_QEMU_URL", hide = true)]
    pub qemu_url: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ExecArgs {
    #[command(flatten)]
    pub container: ContainerArgs,

    /// Command and arguments to run; everything after --cmd is passed through
    #[arg(long, required = true, num_args = 1.., allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct InvalidateArgs {
    #[command(flatten)]
    pub container: ContainerArgs,

    /// Delete the whole container tree, not just its ready marker
    #[arg(long)]
    pub purge: bool,
}
