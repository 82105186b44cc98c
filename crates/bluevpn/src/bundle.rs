//! Configuration bundling.
//!
//! An imported OpenVPN configuration usually points at certificates and keys
//! scattered around the file system. [`bundle`] copies every referenced file
//! into a directory owned by the profile and rewrites the references to bare
//! file names, so OpenVPN can be started with the bundle as its working
//! directory.

use crate::error::{ErrorKind, VpnError, VpnResult};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Directives whose first argument names a file.
pub const FILE_DIRECTIVES: &[&str] = &["ca", "cert", "key", "tls-auth", "pkcs12", "dh", "crl-verify"];

/// Directive dropped from imported configs; the supervisor supplies its own.
pub const CREDENTIAL_DIRECTIVE: &str = "auth-user-pass";

const DEFAULT_EXTENSION: &str = "ovpn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReport {
    pub bundle_dir: PathBuf,
    pub config_path: PathBuf,
    /// Files actually copied into the bundle.
    pub files_copied: usize,
    /// Referenced files that did not exist at import time.
    pub missing: Vec<PathBuf>,
}

/// Rejects profile ids that are not a single plain path component.
///
/// The id names the bundle directory, so it must not be empty, `.` or `..`
/// and must not contain a path separator.
pub fn check_profile_id(id: &str) -> VpnResult<()> {
    let plain = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\'])
        && !Path::new(id).is_absolute();
    if plain {
        Ok(())
    } else {
        Err(VpnError::new(
            ErrorKind::ConfigInvalid,
            format!("invalid profile id {:?}", id),
        ))
    }
}

/// Result of rewriting the configuration text, before touching the disk.
struct Rewrite {
    text: String,
    /// Target file name -> source path.
    copies: BTreeMap<String, PathBuf>,
    missing: Vec<PathBuf>,
}

/// Bundles `source` into `base_dir/<profile_id>`.
///
/// Missing or uncopyable auxiliary files are logged and skipped. Only an
/// unreadable source, a failure to create the bundle directory, or a failure
/// to write the rewritten config abort the bundle.
pub fn bundle(source: &Path, profile_id: &str, base_dir: &Path) -> VpnResult<BundleReport> {
    check_profile_id(profile_id)?;
    let content = fs::read_to_string(source).map_err(|e| {
        VpnError::new(
            ErrorKind::ConfigInvalid,
            format!("cannot read {}: {}", source.display(), e),
        )
    })?;
    let source_dir = source.parent().unwrap_or_else(|| Path::new("."));
    let rewrite = rewrite_config(&content, source_dir);

    let bundle_dir = base_dir.join(profile_id);
    fs::create_dir_all(&bundle_dir).map_err(|e| {
        VpnError::new(
            ErrorKind::ConfigInvalid,
            format!("cannot create {}: {}", bundle_dir.display(), e),
        )
    })?;

    let mut files_copied = 0;
    for (file_name, src) in &rewrite.copies {
        let target = bundle_dir.join(file_name);
        match fs::copy(src, &target) {
            Ok(_) => {
                log::debug!("Copied {} into bundle {}", file_name, profile_id);
                files_copied += 1;
            }
            Err(e) => log::error!("Failed to copy {}: {}", src.display(), e),
        }
    }

    let extension = source
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_EXTENSION);
    let config_path = bundle_dir.join(format!("{}.{}", profile_id, extension));
    fs::write(&config_path, &rewrite.text).map_err(|e| {
        VpnError::new(
            ErrorKind::ConfigInvalid,
            format!("cannot write {}: {}", config_path.display(), e),
        )
    })?;

    log::info!(
        "Bundled {} into {} ({} file(s) copied, {} missing)",
        source.display(),
        bundle_dir.display(),
        files_copied,
        rewrite.missing.len()
    );

    Ok(BundleReport {
        bundle_dir,
        config_path,
        files_copied,
        missing: rewrite.missing,
    })
}

fn rewrite_config(content: &str, source_dir: &Path) -> Rewrite {
    let mut lines = Vec::new();
    let mut copies: BTreeMap<String, PathBuf> = BTreeMap::new();
    // Canonical source -> target name, so one file referenced twice is copied once.
    let mut targets: BTreeMap<PathBuf, String> = BTreeMap::new();
    let mut missing = Vec::new();

    for raw in content.lines() {
        let line = raw.trim();
        let mut tokens = line.split_whitespace();
        let directive = tokens.next().unwrap_or("");

        if directive == CREDENTIAL_DIRECTIVE {
            continue;
        }

        let file_arg = FILE_DIRECTIVES
            .contains(&directive)
            .then(|| tokens.next())
            .flatten();
        let Some(file_arg) = file_arg else {
            lines.push(line.to_string());
            continue;
        };

        let referenced = Path::new(file_arg);
        let resolved = if referenced.is_absolute() {
            referenced.to_path_buf()
        } else {
            source_dir.join(referenced)
        };
        let file_name = resolved.file_name().and_then(|n| n.to_str());

        match file_name {
            Some(name) if resolved.is_file() => {
                let key = fs::canonicalize(&resolved).unwrap_or_else(|_| resolved.clone());
                let name = match targets.get(&key) {
                    Some(existing) => existing.clone(),
                    None => {
                        let unique = unique_name(name, &copies);
                        if unique != name {
                            log::debug!("{} renamed to {} in bundle", resolved.display(), unique);
                        }
                        copies.insert(unique.clone(), resolved.clone());
                        targets.insert(key, unique.clone());
                        unique
                    }
                };
                let rest: Vec<&str> = tokens.collect();
                let mut rewritten = format!("{} {}", directive, name);
                if !rest.is_empty() {
                    rewritten.push(' ');
                    rewritten.push_str(&rest.join(" "));
                }
                lines.push(rewritten);
            }
            _ => {
                log::warn!("Referenced file not found: {}", resolved.display());
                missing.push(resolved);
                lines.push(line.to_string());
            }
        }
    }

    let mut text = lines.join("\n");
    text.push('\n');
    Rewrite {
        text,
        copies,
        missing,
    }
}

/// `name`, or `stem-N.ext` with the smallest N not already taken.
fn unique_name(name: &str, taken: &BTreeMap<String, PathBuf>) -> String {
    if !taken.contains_key(name) {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1..)
        .map(|n| match ext {
            Some(ext) => format!("{}-{}.{}", stem, n, ext),
            None => format!("{}-{}", stem, n),
        })
        .find(|candidate| !taken.contains_key(candidate))
        .unwrap_or_else(|| name.to_string())
}
