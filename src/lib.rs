//! cibox - cached build containers for CI
//!
//! Provisions a root filesystem for a (distro, release, arch) triple inside a
//! cache directory, installs packages into it, and runs commands inside it
//! without root privileges.
//!
//! ## Installation modes
//!
//! - **proot** (Linux hosts): the root is entered through proot's syscall
//!   interception, with a vendored qemu user-mode emulator for foreign archs.
//! - **local** (`--local`, macOS): the host's own package tools unpack
//!   packages into a prefix inside the container directory, and programs
//!   find them through `PATH`-style environment redirection.
//!
//! A container becomes usable only once its ready marker exists. Everything
//! else about its state is read from disk, so interrupted runs are retried
//! from scratch by whichever invocation comes next.

pub mod arch;
pub mod bootstrap;
pub mod catalog;
pub mod cli;
pub mod command_runner;
pub mod config;
pub mod download;
pub mod environment;
pub mod error;
pub mod installer;
pub mod minimize;
pub mod output;
pub mod repository;
pub mod sandbox;
pub mod spec;
pub mod templates;

pub use cli::{Cli, Commands};
pub use error::ContainerError;
