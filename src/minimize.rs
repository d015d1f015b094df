//! Trimming Ubuntu root filesystems down to their required packages.
//!
//! Ubuntu's core images ship more than a build container needs. Before
//! repositories are configured, every installed package outside the
//! release's required set is purged with `dpkg --purge --force-all`.
//! Releases without a known set are left untouched.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

const PRECISE: &[&str] = &[
    "apt", "base-files", "base-passwd", "bash", "bsdutils", "coreutils", "dash", "debconf",
    "debianutils", "diffutils", "dpkg", "findutils", "gcc-4.6-base", "gnupg", "gpgv", "grep",
    "gzip", "libacl1", "libapt-pkg4.12", "libattr1", "libbz2-1.0", "libc-bin", "libc6",
    "libdb5.1", "libffi6", "libgcc1", "liblzma5", "libpam-modules", "libpam-modules-bin",
    "libpam-runtime", "libpam0g", "libreadline6", "libselinux1", "libstdc++6", "libtinfo5",
    "libusb-0.1-4", "makedev", "mawk", "multiarch-support", "perl-base", "readline-common",
    "sed", "sensible-utils", "tar", "tzdata", "ubuntu-keyring", "xz-utils", "zlib1g",
];

const TRUSTY: &[&str] = &[
    "apt", "base-files", "base-passwd", "bash", "bsdutils", "coreutils", "dash", "debconf",
    "debianutils", "diffutils", "dh-python", "dpkg", "findutils", "gcc-4.8-base",
    "gcc-4.9-base", "gnupg", "gpgv", "grep", "gzip", "libacl1", "libapt-pkg4.12", "libaudit1",
    "libaudit-common", "libattr1", "libbz2-1.0", "libc-bin", "libc6", "libcap2", "libdb5.3",
    "libdebconfclient0", "libexpat1", "libmpdec2", "libffi6", "libgcc1", "liblzma5",
    "libncursesw5", "libpcre3", "libpam-modules", "libpam-modules-bin", "libpam-runtime",
    "libpam0g", "libpython3-stdlib", "libpython3.4-stdlib", "libpython3", "libpython3-minimal",
    "libpython3.4", "libpython3.4-minimal", "libreadline6", "libselinux1", "libssl1.0.0",
    "libstdc++6", "libsqlite3-0", "libtinfo5", "libusb-0.1-4", "lsb-release", "makedev",
    "mawk", "mime-support", "multiarch-support", "perl-base", "python3", "python3-minimal",
    "python3.4", "python3.4-minimal", "readline-common", "sed", "sensible-utils", "tar",
    "tzdata", "ubuntu-keyring", "xz-utils", "zlib1g",
];

/// Environment for the purge, so essential packages go without prompting.
pub const PURGE_ENV: [(&str, &str); 2] = [
    ("SUDO_FORCE_REMOVE", "yes"),
    ("DEBIAN_FRONTEND", "noninteractive"),
];

/// Packages an Ubuntu release cannot lose, if cibox knows them.
pub fn required_packages(release: &str) -> Option<&'static [&'static str]> {
    match release {
        "precise" => Some(PRECISE),
        "trusty" => Some(TRUSTY),
        _ => None,
    }
}

/// Package names recorded in `var/lib/dpkg/status` under `root`.
///
/// Entries whose status says `not-installed` are left out. A root without a
/// dpkg database has no packages.
pub fn installed_packages(root: &Path) -> io::Result<Vec<String>> {
    let content = match fs::read_to_string(root.join("var/lib/dpkg/status")) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(parse_status(&content))
}

fn parse_status(content: &str) -> Vec<String> {
    let mut packages = Vec::new();
    for stanza in content.split("\n\n") {
        let mut name = None;
        let mut installed = true;
        for line in stanza.lines() {
            if let Some(value) = line.strip_prefix("Package:") {
                name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Status:") {
                installed = value.split_whitespace().last() != Some("not-installed");
            }
        }
        if let Some(name) = name.filter(|_| installed) {
            packages.push(name);
        }
    }
    packages
}

/// Installed packages that are not in `required`, sorted and deduplicated.
///
/// Architecture qualifiers (`libc6:amd64`) are ignored when comparing.
pub fn removable(installed: &[String], required: &[&str]) -> Vec<String> {
    let required: BTreeSet<&str> = required.iter().copied().collect();
    installed
        .iter()
        .filter(|name| {
            let bare = name.split(':').next().unwrap_or("");
            !required.contains(bare)
        })
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATUS: &str = "\
Package: bash
Status: install ok installed
Version: 4.2-2ubuntu2

Package: ubuntu-minimal
Status: install ok installed
Version: 1.267

Package: old-kernel
Status: purge ok not-installed

Package: libc6
Status: install ok installed
Architecture: amd64
";

    #[test]
    fn status_file_lists_installed_packages_only() {
        assert_eq!(parse_status(STATUS), vec!["bash", "ubuntu-minimal", "libc6"]);
    }

    #[test]
    fn missing_database_means_nothing_installed() {
        let temp = TempDir::new().unwrap();
        assert!(installed_packages(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn required_packages_survive() {
        let installed: Vec<String> = ["bash", "ubuntu-minimal", "libc6:amd64", "vim-tiny", "vim-tiny"]
            .iter()
            .map(|name| name.to_string())
            .collect();
        let precise = required_packages("precise").unwrap();
        assert_eq!(removable(&installed, precise), vec!["ubuntu-minimal", "vim-tiny"]);
    }

    #[test]
    fn unknown_releases_have_no_required_set() {
        assert!(required_packages("trusty").unwrap().contains(&"python3"));
        assert!(required_packages("xenial").is_none());
    }
}
