use crate::error::CommonError;
use flate2::read::GzDecoder;
use lzma_rs::xz_decompress;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    Tar,
    TarGz,
    TarXz,
    Raw,
}

pub fn detect_archive_type(name: &str) -> ArchiveType {
    let lower = name.to_lowercase();
    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        ArchiveType::TarGz
    } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
        ArchiveType::TarXz
    } else if lower.ends_with(".tar") {
        ArchiveType::Tar
    } else {
        ArchiveType::Raw
    }
}

/// What an extraction actually wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractReport {
    pub directories: usize,
    pub files: usize,
    pub links: usize,
    /// Device nodes and FIFOs, which an unprivileged extraction cannot create.
    pub skipped_special: usize,
    /// Entries whose path escapes the target, is consumed by stripping, or
    /// runs through a symlink an earlier entry created.
    pub skipped_paths: usize,
}

/// Unpacks a root filesystem archive into `target_dir`.
///
/// Ownership is never restored. Device nodes and FIFOs are skipped, and every
/// directory is left owner-writable so the tree can be deleted later without
/// elevated privileges. Nothing is ever written through a symlink, so an
/// archive cannot plant `var/run -> /elsewhere` and then write below it.
pub fn extract_rootfs(
    data: &[u8],
    archive_type: ArchiveType,
    target_dir: &Path,
    strip_components: u32,
) -> Result<ExtractReport, CommonError> {
    fs::create_dir_all(target_dir)?;
    match archive_type {
        ArchiveType::TarGz => {
            let mut archive = Archive::new(GzDecoder::new(Cursor::new(data)));
            unpack_tree(&mut archive, target_dir, strip_components)
        }
        ArchiveType::TarXz => {
            let mut decompressed = Vec::new();
            xz_decompress(&mut Cursor::new(data), &mut decompressed)
                .map_err(|err| CommonError::Archive(err.to_string()))?;
            let mut archive = Archive::new(Cursor::new(decompressed));
            unpack_tree(&mut archive, target_dir, strip_components)
        }
        ArchiveType::Tar => {
            let mut archive = Archive::new(Cursor::new(data));
            unpack_tree(&mut archive, target_dir, strip_components)
        }
        ArchiveType::Raw => Err(CommonError::Archive(
            "expected a tar archive, got a raw file".to_string(),
        )),
    }
}

/// Installs a single executable at `dest`.
///
/// `source_name` (usually the download URL) decides whether `data` is the
/// binary itself or an archive containing a file named like `dest`.
pub fn install_binary(data: &[u8], source_name: &str, dest: &Path) -> Result<(), CommonError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let binary_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CommonError::Archive(format!("invalid binary path {}", dest.display())))?;

    match detect_archive_type(source_name) {
        ArchiveType::Raw => fs::write(dest, data)?,
        archive_type => {
            let scratch = parent.join(format!(".extract-{binary_name}-{}", std::process::id()));
            if scratch.exists() {
                fs::remove_dir_all(&scratch)?;
            }
            let outcome = extract_rootfs(data, archive_type, &scratch, 0)
                .and_then(|_| select_binary(&list_files(&scratch)?, binary_name))
                .and_then(|found| {
                    if dest.exists() {
                        fs::remove_file(dest)?;
                    }
                    fs::rename(&found, dest)?;
                    Ok(())
                });
            let _ = fs::remove_dir_all(&scratch);
            outcome?;
        }
    }

    set_executable(dest)
}

pub fn set_executable(path: &Path) -> Result<(), CommonError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}

fn unpack_tree<R: Read>(
    archive: &mut Archive<R>,
    target_dir: &Path,
    strip_components: u32,
) -> Result<ExtractReport, CommonError> {
    let mut report = ExtractReport::default();
    let strip = strip_components as usize;
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive
        .entries()
        .map_err(|err| CommonError::Archive(err.to_string()))?
    {
        let mut entry = entry.map_err(|err| CommonError::Archive(err.to_string()))?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_character_special() || entry_type.is_block_special() || entry_type.is_fifo()
        {
            report.skipped_special += 1;
            continue;
        }

        let entry_path = entry
            .path()
            .map_err(|err| CommonError::Archive(err.to_string()))?
            .to_path_buf();
        let Some(relative) = relative_entry_path(&entry_path, strip) else {
            report.skipped_paths += 1;
            continue;
        };
        let out_path = target_dir.join(&relative);

        if crosses_symlink(target_dir, &relative, entry_type.is_dir()) {
            report.skipped_paths += 1;
            continue;
        }

        if entry_type.is_dir() {
            fs::create_dir_all(&out_path)?;
            ensure_owner_access(&out_path, 0o700)?;
            report.directories += 1;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if entry_type.is_hard_link() {
            let link_name = entry
                .link_name()
                .map_err(|err| CommonError::Archive(err.to_string()))?
                .ok_or_else(|| {
                    CommonError::Archive(format!("hard link {} has no target", entry_path.display()))
                })?;
            let Some(link_relative) = relative_entry_path(&link_name, strip) else {
                report.skipped_paths += 1;
                continue;
            };
            if crosses_symlink(target_dir, &link_relative, false) {
                report.skipped_paths += 1;
                continue;
            }
            if fs::symlink_metadata(&out_path).is_ok() {
                fs::remove_file(&out_path)?;
            }
            fs::hard_link(target_dir.join(link_relative), &out_path)?;
            report.links += 1;
            continue;
        }

        // Replace, never follow, a symlink left at this path.
        if fs::symlink_metadata(&out_path).is_ok_and(|meta| meta.file_type().is_symlink()) {
            fs::remove_file(&out_path)?;
        }
        entry
            .unpack(&out_path)
            .map_err(|err| CommonError::Archive(format!("{}: {err}", entry_path.display())))?;

        if entry_type.is_symlink() {
            report.links += 1;
        } else {
            ensure_owner_access(&out_path, 0o600)?;
            report.files += 1;
        }
    }

    Ok(report)
}

/// Normalises an archive member path, dropping `strip` leading components.
/// Returns `None` for paths that would leave the target directory.
fn relative_entry_path(path: &Path, strip: usize) -> Option<PathBuf> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }

    if parts.len() <= strip {
        return None;
    }
    Some(parts[strip..].iter().collect())
}

/// Whether `relative` reaches into `target_dir` through a symlink. The last
/// component is only checked when `include_last` is set.
fn crosses_symlink(target_dir: &Path, relative: &Path, include_last: bool) -> bool {
    let components: Vec<Component<'_>> = relative.components().collect();
    let checked = if include_last {
        components.len()
    } else {
        components.len().saturating_sub(1)
    };

    let mut current = target_dir.to_path_buf();
    for component in &components[..checked] {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return true,
            Ok(_) => {}
            // Nothing below a missing component exists yet.
            Err(_) => return false,
        }
    }
    false
}

fn ensure_owner_access(path: &Path, bits: u32) -> Result<(), CommonError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        let mode = perms.mode();
        if mode & bits != bits {
            perms.set_mode(mode | bits);
            fs::set_permissions(path, perms)?;
        }
    }
    #[cfg(not(unix))]
    let _ = (path, bits);

    Ok(())
}

fn list_files(dir: &Path) -> Result<Vec<PathBuf>, CommonError> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

fn select_binary(paths: &[PathBuf], binary_name: &str) -> Result<PathBuf, CommonError> {
    let matching: Vec<&PathBuf> = paths
        .iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name == binary_name || name == format!("{binary_name}-static"))
                .unwrap_or(false)
        })
        .collect();

    match matching.as_slice() {
        [only] => Ok((*only).clone()),
        [] if paths.len() == 1 => Ok(paths[0].clone()),
        [] => Err(CommonError::Archive(format!(
            "archive contains {} files but none is named '{binary_name}'",
            paths.len()
        ))),
        _ => Err(CommonError::Archive(format!(
            "multiple files named '{binary_name}' in archive"
        ))),
    }
}
