use std::env;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::bail;
use anyhow::Context;
use tokio::process::Command;

/// Environment variable to override the path to the fio binary used to run benchmarks.
pub const DT_FIO_PATH_ENV: &str = "DT_FIO_PATH";

/// Get the path to the fio binary.
///
/// Search order is the [`DT_FIO_PATH_ENV`] environment variable, then the configured path, then
/// `fio` on the user's `PATH`. An override that points at a path which does not exist is an
/// error rather than a reason to keep searching.
pub fn fio_path(configured: Option<&Path>) -> anyhow::Result<PathBuf> {
    match env::var(DT_FIO_PATH_ENV).ok().as_deref() {
        Some("") => {
            bail!("'{DT_FIO_PATH_ENV}' set to empty string");
        }
        Some("fio") => fio_on_path(),
        Some(path) => existing_path(PathBuf::from(path), DT_FIO_PATH_ENV),
        None => match configured {
            Some(path) => existing_path(path.to_path_buf(), "engine.path"),
            None => fio_on_path(),
        },
    }
}

fn fio_on_path() -> anyhow::Result<PathBuf> {
    log::debug!("No fio path configured so looking in user's 'PATH'");
    which::which("fio").with_context(|| {
        format!(
            "fio binary not found in PATH. Please install fio or set '{DT_FIO_PATH_ENV}' to the correct path."
        )
    })
}

fn existing_path(path: PathBuf, source: &str) -> anyhow::Result<PathBuf> {
    if !path.exists() {
        bail!(
            "Path to fio binary set by '{source}' to '{}' but that path doesn't exist",
            path.display()
        );
    }
    Ok(path)
}

/// Get the version string of the fio binary by running `fio --version`.
///
/// Returns `None` if the binary does not answer within the timeout or prints nothing useful, a
/// missing version is not a reason to refuse a run.
pub async fn fio_version(path: &Path, timeout: Duration) -> Option<String> {
    let output = Command::new(path)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, output).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(Ok(output)) => {
            log::warn!("'fio --version' exited with {}", output.status);
            return None;
        }
        Ok(Err(e)) => {
            log::warn!("Failed to execute 'fio --version': {e}");
            return None;
        }
        Err(_) => {
            log::warn!("Timed out waiting for 'fio --version'");
            return None;
        }
    };

    let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!version.is_empty()).then_some(version)
}

#[cfg(test)]
mod tests {
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt as _;

    use serial_test::serial;
    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    #[test]
    #[serial]
    fn override_that_does_not_exist_is_an_error() {
        env::set_var(DT_FIO_PATH_ENV, "/non/existent/path/to/fio");
        let result = fio_path(None);
        env::remove_var(DT_FIO_PATH_ENV);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn empty_override_is_an_error() {
        env::set_var(DT_FIO_PATH_ENV, "");
        let result = fio_path(None);
        env::remove_var(DT_FIO_PATH_ENV);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn override_takes_precedence_over_configured_path() {
        let env_file = NamedTempFile::new().unwrap();
        let configured = NamedTempFile::new().unwrap();
        env::set_var(DT_FIO_PATH_ENV, env_file.path());
        let result = fio_path(Some(configured.path()));
        env::remove_var(DT_FIO_PATH_ENV);
        assert_eq!(result.unwrap(), env_file.path());
    }

    #[test]
    #[serial]
    fn configured_path_is_used_without_override() {
        env::remove_var(DT_FIO_PATH_ENV);
        let configured = NamedTempFile::new().unwrap();
        assert_eq!(fio_path(Some(configured.path())).unwrap(), configured.path());
        assert!(fio_path(Some(Path::new("/non/existent/fio"))).is_err());
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn falls_back_to_path_lookup() {
        let temp = TempDir::new().unwrap();
        let fio_file_path = temp.path().join("fio");
        std::fs::write(&fio_file_path, "#!/bin/sh\necho fio-3.36\n").unwrap();
        let mut perms = std::fs::metadata(&fio_file_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&fio_file_path, perms).unwrap();

        let original_path = env::var_os("PATH");
        env::set_var("PATH", temp.path());
        env::remove_var(DT_FIO_PATH_ENV);

        let result = fio_path(None);

        if let Some(original_path) = original_path {
            env::set_var("PATH", original_path);
        }
        assert_eq!(result.unwrap(), fio_file_path);
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial]
    async fn version_is_read_from_stdout() {
        let temp = TempDir::new().unwrap();
        let fio_file_path = temp.path().join("fio");
        std::fs::write(&fio_file_path, "#!/bin/sh\necho fio-3.36\n").unwrap();
        let mut perms = std::fs::metadata(&fio_file_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&fio_file_path, perms).unwrap();

        let version = fio_version(&fio_file_path, Duration::from_secs(5)).await;
        assert_eq!(version.as_deref(), Some("fio-3.36"));
    }

    #[tokio::test]
    async fn version_of_missing_binary_is_none() {
        let version = fio_version(Path::new("/non/existent/fio"), Duration::from_secs(1)).await;
        assert_eq!(version, None);
    }
}
