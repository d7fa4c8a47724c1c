// Environment contract with the monitored process: where the SDK should send
// its log and how verbose it should be.

use crate::channel::ChannelAddress;
use log::info;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use thiserror::Error;

pub const LOG_DEST_VAR: &str = "UH_LOG_DEST";
pub const LOG_LEVEL_VAR: &str = "UH_LOG_LEVEL";
pub const LOG_DEST_FORCE_VAR: &str = "UH_LOG_DEST_FORCE";
pub const LOG_LEVEL_FORCE_VAR: &str = "UH_LOG_LEVEL_FORCE";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Executable not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to launch {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Variables the SDK reads at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoredEnvironment {
    destination: ChannelAddress,
    log_level: u8,
}

impl MonitoredEnvironment {
    pub fn new(destination: ChannelAddress, log_level: u8) -> Self {
        Self {
            destination,
            log_level,
        }
    }

    pub fn destination(&self) -> &ChannelAddress {
        &self.destination
    }

    pub fn vars(&self) -> Vec<(&'static str, String)> {
        vec![
            (LOG_LEVEL_VAR, self.log_level.to_string()),
            (LOG_DEST_VAR, self.destination.to_string()),
            (LOG_LEVEL_FORCE_VAR, "1".to_string()),
            (LOG_DEST_FORCE_VAR, "1".to_string()),
        ]
    }

    /// Set the variables on this process so anything it starts inherits them.
    ///
    /// Call before other threads read the environment.
    pub fn export(&self) {
        for (key, value) in self.vars() {
            std::env::set_var(key, value);
        }
        info!(
            "[ENV] {}={} {}={}",
            LOG_DEST_VAR, self.destination, LOG_LEVEL_VAR, self.log_level
        );
    }

    pub fn apply<'a>(&self, command: &'a mut Command) -> &'a mut Command {
        command.envs(self.vars())
    }

    /// Start `executable` from its own directory with the variables applied.
    pub fn launch(&self, executable: &Path) -> Result<Child, LaunchError> {
        if !executable.is_file() {
            return Err(LaunchError::NotFound(executable.to_path_buf()));
        }

        let mut command = Command::new(executable);
        if let Some(dir) = executable.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        self.apply(&mut command);

        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            path: executable.to_path_buf(),
            source,
        })?;
        info!(
            "[ENV] Launched {} (pid {})",
            executable.display(),
            child.id()
        );
        Ok(child)
    }
}
