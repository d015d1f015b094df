//! Repository and package list files.
//!
//! Repository lines may carry `{placeholder}` shortcuts that expand to the
//! release name or to well known mirrors. A placeholder the selected distro
//! does not know is left in place and reported as a warning.

use crate::arch::Arch;
use crate::error::ContainerError;
use crate::spec::Distro;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const UBUNTU_MAIN_ARCHIVE: &str = "http://archive.ubuntu.com/ubuntu/";
pub const UBUNTU_PORTS_ARCHIVE: &str = "http://ports.ubuntu.com/ubuntu-ports/";
pub const DEBIAN_ARCHIVE: &str = "http://ftp.debian.org/";
pub const LAUNCHPAD_PPA: &str = "http://ppa.launchpad.net/";

fn lines_of(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn read_list(path: &Path) -> Result<String, ContainerError> {
    fs::read_to_string(path).map_err(|e| {
        ContainerError::Configuration(format!("cannot read {}: {e}", path.display()))
    })
}

/// Placeholder values available when rendering for one container.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub distro: Distro,
    pub release: String,
    pub arch: Arch,
}

impl TemplateContext {
    pub fn lookup(&self, placeholder: &str) -> Option<String> {
        match (placeholder, self.distro) {
            ("release", _) => Some(self.release.clone()),
            ("ubuntu", Distro::Ubuntu) => Some(ubuntu_archive(self.arch).to_string()),
            ("launchpad", Distro::Ubuntu) => Some(LAUNCHPAD_PPA.to_string()),
            ("debian", Distro::Ubuntu | Distro::Debian) => Some(DEBIAN_ARCHIVE.to_string()),
            _ => None,
        }
    }
}

/// Ubuntu serves i386 and amd64 from the main archive, everything else from ports.
pub fn ubuntu_archive(arch: Arch) -> &'static str {
    match arch {
        Arch::X86 | Arch::X86_64 => UBUNTU_MAIN_ARCHIVE,
        _ => UBUNTU_PORTS_ARCHIVE,
    }
}

/// Repository lines as the user wrote them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryConfig {
    lines: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedRepositories {
    pub lines: Vec<String>,
    pub warnings: Vec<String>,
}

impl RepositoryConfig {
    pub fn parse(content: &str) -> Self {
        Self {
            lines: lines_of(content).map(str::to_string).collect(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ContainerError> {
        Ok(Self::parse(&read_list(path)?))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn render(&self, context: &TemplateContext) -> RenderedRepositories {
        let mut rendered = RenderedRepositories::default();
        for line in &self.lines {
            let (text, unknown) = substitute(line, context);
            for name in unknown {
                let message = format!(
                    "placeholder {{{name}}} is not recognised for {}, left unchanged in: {line}",
                    context.distro
                );
                warn!("{message}");
                rendered.warnings.push(message);
            }
            rendered.lines.push(text);
        }
        rendered
    }
}

/// Replaces every `{name}` the context knows. Returns the new text and the
/// names it did not know.
pub fn substitute(line: &str, context: &TemplateContext) -> (String, Vec<String>) {
    let mut out = String::with_capacity(line.len());
    let mut unknown = Vec::new();
    let mut rest = line;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());

        if name_len > 0 && after[name_len..].starts_with('}') {
            let name = &after[..name_len];
            match context.lookup(name) {
                Some(value) => out.push_str(&value),
                None => {
                    out.push_str(&rest[open..open + name_len + 2]);
                    unknown.push(name.to_string());
                }
            }
            rest = &after[name_len + 1..];
        } else {
            out.push('{');
            rest = after;
        }
    }
    out.push_str(rest);

    (out, unknown)
}

/// Package names in file order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageList {
    packages: Vec<String>,
}

impl PackageList {
    pub fn parse(content: &str) -> Self {
        let mut packages: Vec<String> = Vec::new();
        for name in lines_of(content) {
            if !packages.iter().any(|existing| existing == name) {
                packages.push(name.to_string());
            }
        }
        Self { packages }
    }

    pub fn from_file(path: &Path) -> Result<Self, ContainerError> {
        Ok(Self::parse(&read_list(path)?))
    }

    pub fn names(&self) -> &[String] {
        &self.packages
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Splits into (names for the package manager, URLs fetched directly).
    pub fn partition_urls(&self) -> (Vec<&str>, Vec<&str>) {
        self.packages
            .iter()
            .map(String::as_str)
            .partition(|name| !name.contains("://"))
    }
}
