use anyhow::Context;
use std::env;
use std::path::PathBuf;

/// Platform-relative path from the home directory to the bluevpn data directory.
#[cfg(target_os = "linux")]
const DATA_SUBPATH: &str = ".local/share/bluevpn";

#[cfg(target_os = "macos")]
const DATA_SUBPATH: &str = "Library/Application Support/bluevpn";

#[cfg(target_os = "windows")]
const DATA_SUBPATH: &str = "AppData/Roaming/bluevpn";

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const DATA_SUBPATH: &str = ".bluevpn";

/// Returns a platform-appropriate user data directory holding the JSON
/// documents and the profile bundles.
///
/// - **Linux:** `~/.local/share/bluevpn`
/// - **macOS:** `~/Library/Application Support/bluevpn`
/// - **Windows:** `%USERPROFILE%\AppData\Roaming\bluevpn`
///
/// Creates the directory if it does not already exist.
pub fn get_user_data_dir() -> anyhow::Result<PathBuf> {
    let home_dir = env::var("HOME")
        .or_else(|_| env::var("USERPROFILE"))
        .context("neither HOME nor USERPROFILE is set")?;
    let user_data_dir = PathBuf::from(&home_dir).join(DATA_SUBPATH);

    if !user_data_dir.exists() {
        std::fs::create_dir_all(&user_data_dir)
            .with_context(|| format!("creating {:?}", user_data_dir))?;
        log::info!("User data directory created at: {:?}", user_data_dir);
    }

    Ok(user_data_dir)
}

/// Returns at most the first `n` characters of `s`.
pub fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
