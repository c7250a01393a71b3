//! Configuration builders for tests.

use std::path::{Path, PathBuf};

use hast_config::{HastConfig, ReplicationMode, ResourceConfig};

/// Fluent builder for [`HastConfig`] in tests.
///
/// The control socket lives in `dir` and the daemon listens on an ephemeral
/// loopback port, so several daemons can run side by side.
///
/// ```ignore
/// let dir = tempfile::tempdir().unwrap();
/// let config = TestConfigBuilder::new(dir.path())
///     .resource("r0", &storage_file(dir.path(), "r0"), "tcp://127.0.0.1")
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: HastConfig,
}

impl TestConfigBuilder {
    pub fn new(dir: &Path) -> Self {
        let mut config = HastConfig::default();
        config.daemon.control = format!("uds://{}", dir.join("hastctl").display());
        config.daemon.listen = "tcp://127.0.0.1:0".to_string();
        config.daemon.timeout = 5;
        Self { config }
    }

    pub fn control(mut self, addr: &str) -> Self {
        self.config.daemon.control = addr.to_string();
        self
    }

    pub fn listen(mut self, addr: &str) -> Self {
        self.config.daemon.listen = addr.to_string();
        self
    }

    pub fn timeout(mut self, secs: u64) -> Self {
        self.config.daemon.timeout = secs;
        self
    }

    pub fn replication(mut self, mode: ReplicationMode) -> Self {
        self.config.daemon.replication = mode;
        self
    }

    pub fn exec(mut self, program: &str) -> Self {
        self.config.daemon.exec = program.to_string();
        self
    }

    pub fn resource(self, name: &str, local: &str, remote: &str) -> Self {
        self.resource_config(ResourceConfig::new(name, local, remote))
    }

    pub fn resource_config(mut self, resource: ResourceConfig) -> Self {
        self.config.resources.push(resource);
        self
    }

    /// Finish the configuration, with resource defaults resolved.
    pub fn build(mut self) -> HastConfig {
        self.config.resolve();
        self.config
    }
}

/// Create an empty local storage file named `name` in `dir` and return its
/// path.
pub fn storage_file(dir: &Path, name: &str) -> String {
    let path: PathBuf = dir.join(format!("{name}.img"));
    std::fs::write(&path, [0u8; 4096]).expect("failed to create storage file");
    path.display().to_string()
}
