//! Daemon test fixture.

use std::path::{Path, PathBuf};

use hast_config::HastConfig;
use hast_core::Daemon;
use tempfile::TempDir;

use crate::launcher::RecordingLauncher;

/// A daemon driven by a [`RecordingLauncher`], with its config file and
/// control socket in a temp directory that is removed on drop.
pub struct TestDaemon {
    pub daemon: Daemon<RecordingLauncher>,
    pub config_path: PathBuf,
    dir: TempDir,
}

impl TestDaemon {
    /// Write `config` to the temp dir and start a daemon on it. `dir` must be
    /// the directory the config's paths were built against.
    pub async fn start(dir: TempDir, config: HastConfig) -> Self {
        Self::start_with(dir, config, RecordingLauncher::new()).await
    }

    pub async fn start_with(dir: TempDir, config: HastConfig, launcher: RecordingLauncher) -> Self {
        let config_path = dir.path().join("hast.toml");
        write_config_file(&config_path, &config).await;
        let daemon = Daemon::start(config, Some(config_path.clone()), launcher)
            .await
            .expect("failed to start test daemon");
        Self {
            daemon,
            config_path,
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn launcher(&mut self) -> &mut RecordingLauncher {
        self.daemon.launcher_mut()
    }

    /// Overwrite the config file (for reload testing).
    pub async fn write_config(&self, config: &HastConfig) {
        write_config_file(&self.config_path, config).await;
    }
}

async fn write_config_file(path: &Path, config: &HastConfig) {
    let content = toml::to_string(config).expect("failed to serialize test config");
    tokio::fs::write(path, content)
        .await
        .expect("failed to write test config");
}
