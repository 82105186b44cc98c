//! Transient `--auth-user-pass` file.

use anyhow::Context;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Owner-only file holding `<username>\n<password>\n` for one session.
///
/// [`scrub`](Self::scrub) overwrites and removes the file; it runs at most
/// once, and dropping the guard runs it if nobody did.
pub(crate) struct CredentialFile {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl CredentialFile {
    /// Creates the file in `dir`, or in the system temp directory.
    pub(crate) fn create(dir: Option<&Path>, username: &str, password: &str) -> anyhow::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bluevpn-auth-").suffix(".txt");
        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context("creating credential file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }

        write!(file, "{}\n{}\n", username, password)?;
        file.as_file().sync_all()?;

        let path = file.path().to_path_buf();
        log::debug!("Credential file written to {}", path.display());
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn is_scrubbed(&self) -> bool {
        self.file.is_none()
    }

    /// Overwrites the contents and deletes the file. Failures are logged,
    /// never returned, so teardown always proceeds.
    pub(crate) fn scrub(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };

        let overwrite = (|| -> std::io::Result<()> {
            let len = file.as_file().metadata()?.len();
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&vec![0u8; len as usize])?;
            file.as_file().sync_all()
        })();
        if let Err(e) = overwrite {
            log::warn!("Could not overwrite credential file {}: {}", self.path.display(), e);
        }

        match file.close() {
            Ok(()) => log::debug!("Credential file {} removed", self.path.display()),
            Err(e) => log::error!(
                "Failed to remove credential file {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        self.scrub();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_credentials_and_scrubs_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut cred = CredentialFile::create(Some(dir.path()), "alice", "pw").unwrap();
        let path = cred.path().to_path_buf();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "alice\npw\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        cred.scrub();
        assert!(cred.is_scrubbed());
        assert!(!path.exists());
        cred.scrub();
    }

    #[test]
    fn drop_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let cred = CredentialFile::create(Some(dir.path()), "bob", "pw").unwrap();
            cred.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
