// SPDX-License-Identifier: MIT OR Apache-2.0
//! Applying the runtime-setup payload when the image was not pre-built.
//!
//! The payload's `runtime_requirements` name the worker library itself;
//! provisioning the worker is the launching driver's job, so this module
//! only applies environment defaults, the working directory, and package
//! installs.

use crate::WorkerError;
use coral_protocol::setup::RuntimeSetup;
use tokio::process::Command;
use tracing::{debug, info};

/// Command prefix that installs OS packages inside the container.
const SYSTEM_INSTALLER: &[&str] = &["apt-get", "install", "-y"];

/// Command prefix that installs packages for the image's declared runtime.
const RUNTIME_INSTALLER: &[&str] = &["python", "-m", "pip", "install", "--no-cache-dir"];

/// Apply a runtime-setup payload to the current process.
///
/// Environment defaults are only set where the variable is not already
/// present. The working directory is created and changed into. Package
/// installs shell out to the platform installers and fail loudly when the
/// installer is missing but packages were requested.
///
/// # Errors
///
/// Propagates filesystem failures and non-zero installer exits.
pub async fn apply_runtime_setup(setup: &RuntimeSetup) -> Result<(), WorkerError> {
    apply_env_defaults(setup);

    if !setup.workdir.is_empty() {
        std::fs::create_dir_all(&setup.workdir).map_err(|source| WorkerError::Io {
            path: setup.workdir.clone().into(),
            source,
        })?;
        std::env::set_current_dir(&setup.workdir).map_err(|source| WorkerError::Io {
            path: setup.workdir.clone().into(),
            source,
        })?;
        debug!(workdir = %setup.workdir, "working directory applied");
    }

    if !setup.system_packages.is_empty() {
        run_installer(&["apt-get", "update"], &[]).await?;
        run_installer(SYSTEM_INSTALLER, &setup.system_packages).await?;
    }
    if !setup.runtime_packages.is_empty() {
        run_installer(RUNTIME_INSTALLER, &setup.runtime_packages).await?;
    }
    Ok(())
}

fn apply_env_defaults(setup: &RuntimeSetup) {
    for (key, value) in &setup.env {
        if std::env::var_os(key).is_some() {
            continue;
        }
        // SAFETY: the worker applies setup before invoking the target and
        // before spawning any threads that read the environment.
        unsafe { std::env::set_var(key, value) };
    }
}

async fn run_installer(prefix: &[&str], packages: &[String]) -> Result<(), WorkerError> {
    let program = prefix[0];
    info!(program, count = packages.len(), "installing packages");
    let status = Command::new(program)
        .args(&prefix[1..])
        .args(packages)
        .status()
        .await
        .map_err(|source| WorkerError::Installer {
            program: program.to_string(),
            detail: source.to_string(),
        })?;
    if !status.success() {
        return Err(WorkerError::Installer {
            program: program.to_string(),
            detail: format!("exited with {status}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_defaults_do_not_override_existing() {
        let mut setup = RuntimeSetup::default();
        setup
            .env
            .insert("CORAL_SETUP_TEST_EXISTING".to_string(), "new".to_string());
        setup
            .env
            .insert("CORAL_SETUP_TEST_FRESH".to_string(), "fresh".to_string());

        // SAFETY: single-threaded test process.
        unsafe { std::env::set_var("CORAL_SETUP_TEST_EXISTING", "old") };
        apply_env_defaults(&setup);

        assert_eq!(
            std::env::var("CORAL_SETUP_TEST_EXISTING").unwrap(),
            "old"
        );
        assert_eq!(std::env::var("CORAL_SETUP_TEST_FRESH").unwrap(), "fresh");
    }
}
