//! Environment overrides handed to sandboxed processes.

use crate::arch::Arch;
use crate::spec::Distro;
use std::fs;
use std::path::Path;

/// Variables to prepend to (search paths) or replace in the caller's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentOverrides {
    prepend: Vec<(String, String)>,
    overwrite: Vec<(String, String)>,
}

impl EnvironmentOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepend(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.prepend.push((key.into(), value.into()));
        self
    }

    pub fn overwrite(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.overwrite.retain(|(existing, _)| *existing != key);
        self.overwrite.push((key, value.into()));
        self
    }

    /// Overrides for a proot guest: the guest's `/etc/environment`, then a C locale.
    ///
    /// `*PATH` keys are prepended to the host value, everything else replaces it.
    pub fn for_proot(root: &Path) -> Self {
        let mut overrides = Self::new();
        if let Ok(content) = fs::read_to_string(root.join("etc/environment")) {
            for (key, value) in parse_environment_file(&content) {
                overrides = if key.ends_with("PATH") {
                    overrides.prepend(key, value)
                } else {
                    overrides.overwrite(key, value)
                };
            }
        }
        overrides.overwrite("LANG", "C").overwrite("LC_ALL", "C")
    }

    /// Overrides for local installs: point tool discovery at the container prefix.
    pub fn for_local(root: &Path, distro: Distro, arch: Arch) -> Self {
        if distro == Distro::Osx {
            return Self::new()
                .prepend("PATH", under(root, &["bin"]))
                .prepend("LD_LIBRARY_PATH", under(root, &["lib"]))
                .prepend("PKG_CONFIG_PATH", under(root, &["lib", "pkgconfig"]));
        }

        let triple = multiarch_triple(arch);
        Self::new()
            .prepend("PATH", [under(root, &["usr", "bin"]), under(root, &["bin"])].join(":"))
            .prepend(
                "LD_LIBRARY_PATH",
                [under(root, &["usr", "lib", triple]), under(root, &["usr", "lib"])].join(":"),
            )
            .prepend(
                "PKG_CONFIG_PATH",
                [
                    under(root, &["usr", "lib", "pkgconfig"]),
                    under(root, &["usr", "lib", triple, "pkgconfig"]),
                    under(root, &["usr", "share", "pkgconfig"]),
                ]
                .join(":"),
            )
    }

    /// Final variable list given the caller's current values.
    pub fn resolve(&self, current: impl Fn(&str) -> Option<String>) -> Vec<(String, String)> {
        let mut resolved: Vec<(String, String)> = Vec::new();
        for (key, value) in &self.prepend {
            let combined = match current(key) {
                Some(existing) if !existing.is_empty() => format!("{value}:{existing}"),
                _ => value.clone(),
            };
            resolved.push((key.clone(), combined));
        }
        for (key, value) in &self.overwrite {
            resolved.retain(|(existing, _)| existing != key);
            resolved.push((key.clone(), value.clone()));
        }
        resolved
    }

    pub fn resolve_from_process(&self) -> Vec<(String, String)> {
        self.resolve(|key| std::env::var(key).ok())
    }
}

fn under(root: &Path, parts: &[&str]) -> String {
    parts
        .iter()
        .fold(root.to_path_buf(), |path, part| path.join(part))
        .display()
        .to_string()
}

fn multiarch_triple(arch: Arch) -> &'static str {
    match arch {
        Arch::X86 => "i386-linux-gnu",
        Arch::X86_64 => "x86_64-linux-gnu",
        Arch::Arm => "arm-linux-gnueabihf",
        Arch::Aarch64 => "aarch64-linux-gnu",
        Arch::Ppc => "powerpc-linux-gnu",
        Arch::Ppc64 => "powerpc64le-linux-gnu",
    }
}

/// Parses `KEY="value"` lines, dropping quotes, comments and blank lines.
fn parse_environment_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value: String = value.chars().filter(|c| *c != '"' && *c != '\'').collect();
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn host(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn guest_environment_file_is_honoured() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("etc")).unwrap();
        fs::write(
            temp.path().join("etc/environment"),
            "PATH=\"/usr/local/sbin:/usr/bin\"\nEDITOR=vi\nLANG=en_US.UTF-8\n",
        )
        .unwrap();

        let env = EnvironmentOverrides::for_proot(temp.path())
            .resolve(host(&[("PATH", "/host/bin"), ("EDITOR", "nano")]));
        let env: HashMap<_, _> = env.into_iter().collect();

        assert_eq!(env["PATH"], "/usr/local/sbin:/usr/bin:/host/bin");
        assert_eq!(env["EDITOR"], "vi");
        assert_eq!(env["LANG"], "C");
        assert_eq!(env["LC_ALL"], "C");
    }

    #[test]
    fn missing_environment_file_still_forces_locale() {
        let temp = TempDir::new().unwrap();
        let env = EnvironmentOverrides::for_proot(temp.path()).resolve(host(&[]));
        assert_eq!(
            env,
            vec![("LANG".to_string(), "C".to_string()), ("LC_ALL".to_string(), "C".to_string())]
        );
    }

    #[test]
    fn local_mode_prepends_container_prefixes() {
        let env = EnvironmentOverrides::for_local(Path::new("/c/root"), Distro::Ubuntu, Arch::X86_64)
            .resolve(host(&[("PATH", "/usr/bin")]));
        let env: HashMap<_, _> = env.into_iter().collect();

        assert_eq!(env["PATH"], "/c/root/usr/bin:/c/root/bin:/usr/bin");
        assert!(env["LD_LIBRARY_PATH"].starts_with("/c/root/usr/lib/x86_64-linux-gnu:"));
        assert!(env["PKG_CONFIG_PATH"].contains("/c/root/usr/lib/pkgconfig"));
    }

    #[test]
    fn osx_local_mode_uses_flat_prefix() {
        let env = EnvironmentOverrides::for_local(Path::new("/brew"), Distro::Osx, Arch::X86_64)
            .resolve(host(&[]));
        assert!(env.contains(&("PATH".to_string(), "/brew/bin".to_string())));
    }
}
