//! Plugin environments as `uv` virtual environments.
//!
//! Each plugin gets a brand-new virtual environment under its temporary
//! root. Installation happens in two steps so plugins are tested against
//! the distribution's pinned dependency set:
//!
//! 1. `uv pip install -r <requirements> --reinstall` installs the
//!    distribution's lock file, when one is configured
//! 2. `uv pip install -r <manifest> --all-extras -c <requirements>`
//!    installs the plugin with every extra, constrained by the lock file

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Command, EnvHandle, EnvRequest, ProvisionError, Provisioner, exec, last_line};
use crate::config::{ProvisionConfig, expand_path};
use crate::logs::PluginLog;

/// Name of the environment directory inside the plugin workspace.
const VENV_DIR: &str = "venv";

/// [`Provisioner`] backed by the `uv` binary.
pub struct UvProvisioner {
    config: ProvisionConfig,
    requirements: Option<PathBuf>,
}

impl UvProvisioner {
    /// Creates a provisioner. The requirements path is resolved against the
    /// current directory now, since installs run inside plugin checkouts.
    pub fn new(config: ProvisionConfig) -> Self {
        let requirements = config
            .requirements
            .as_deref()
            .map(expand_path)
            .map(|path| std::path::absolute(&path).unwrap_or(path));

        Self {
            config,
            requirements,
        }
    }

    fn uv(&self) -> Command {
        Command::new(&self.config.uv).env("UV_NO_PROGRESS", "1")
    }

    /// The lock file, if configured and present.
    fn lock_file(&self, log: &PluginLog) -> Option<&Path> {
        let path = self.requirements.as_deref()?;
        if path.is_file() {
            Some(path)
        } else {
            log.warn(format!(
                "Requirements file {} not found, installing unconstrained",
                path.display()
            ));
            None
        }
    }
}

/// Interpreter path inside a virtual environment.
fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

#[async_trait]
impl Provisioner for UvProvisioner {
    fn name(&self) -> &str {
        "uv"
    }

    async fn create_env(
        &self,
        request: &EnvRequest<'_>,
        log: &PluginLog,
    ) -> Result<EnvHandle, ProvisionError> {
        let root = request.workspace.join(VENV_DIR);
        let python = venv_python(&root);

        let handle = EnvHandle {
            plugin: request.plugin.to_string(),
            root: root.clone(),
            python: python.clone(),
            checkout: request.checkout.to_path_buf(),
            workspace: request.workspace.to_path_buf(),
        };

        let venv = self
            .uv()
            .arg("venv")
            .args(["-p", self.config.python.as_str(), "--seed"])
            .path_arg(&root)
            .working_dir(request.workspace);
        let result = exec(&venv, log).await?;
        if !result.success() {
            return Err(ProvisionError::CreateEnv(last_line(&result.stderr).to_string()));
        }

        let lock = self.lock_file(log);

        if let Some(lock) = lock {
            let install = self
                .uv()
                .args(["pip", "install", "-r"])
                .path_arg(lock)
                .args(["--reinstall", "--quiet", "-p"])
                .path_arg(&python)
                .working_dir(request.workspace);
            let result = exec(&install, log).await?;
            if !result.success() {
                return Err(ProvisionError::Install {
                    what: "distribution requirements".to_string(),
                    reason: last_line(&result.stderr).to_string(),
                });
            }
        }

        let manifest = request.checkout.join(request.manifest);
        if !manifest.is_file() {
            return Err(ProvisionError::MissingManifest(manifest));
        }

        let mut install = self
            .uv()
            .args(["pip", "install", "-r"])
            .path_arg(&manifest)
            .args(["--all-extras", "-p"])
            .path_arg(&python)
            .working_dir(request.checkout);
        if self.config.constrain
            && let Some(lock) = lock
        {
            install = install.arg("-c").path_arg(lock);
        }

        let result = exec(&install, log).await?;
        if !result.success() {
            return Err(ProvisionError::Install {
                what: request.plugin.to_string(),
                reason: last_line(&result.stderr).to_string(),
            });
        }

        log.info(format!("Environment ready at {}", root.display()));
        Ok(handle)
    }

    async fn destroy_env(&self, env: &EnvHandle) -> Result<(), ProvisionError> {
        match tokio::fs::remove_dir_all(&env.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProvisionError::Remove {
                path: env.root.clone(),
                source,
            }),
        }
    }
}
