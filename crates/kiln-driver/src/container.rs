//! Build container configuration.

use std::collections::BTreeMap;

use kiln_common::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};

/// Placeholder replaced by the configured image in run command arguments.
pub const IMAGE_PLACEHOLDER: &str = "{{.Image}}";

/// Command run as PID 1 when none is configured.
pub const DEFAULT_RUN_COMMAND: &[&str] = &["/bin/sh"];

/// Everything needed to start a build container.
///
/// Built once by the caller and handed to
/// [`Driver::start_container`](crate::Driver::start_container). The
/// passthrough lists are forwarded to the runtime untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ContainerConfig {
    /// Base image reference.
    pub image: String,
    /// Process and arguments run as PID 1.
    pub run_command: Vec<String>,
    /// Host devices to expose.
    pub device: Vec<String>,
    /// Capabilities to add.
    pub cap_add: Vec<String>,
    /// Capabilities to drop.
    pub cap_drop: Vec<String>,
    /// Host path to container path mounts.
    pub volumes: BTreeMap<String, String>,
    /// Temporary filesystem mounts.
    pub tmpfs: Vec<String>,
    /// Run with extended privileges.
    pub privileged: bool,
    /// Runtime variant (e.g. `runsc`); `None` keeps the runtime default.
    pub runtime: Option<String>,
    /// Target platform (e.g. `linux/arm64`); `None` means the host platform.
    pub platform: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            run_command: DEFAULT_RUN_COMMAND.iter().map(ToString::to_string).collect(),
            device: Vec::new(),
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            volumes: BTreeMap::new(),
            tmpfs: Vec::new(),
            privileged: false,
            runtime: None,
            platform: None,
        }
    }
}

impl ContainerConfig {
    /// Create a configuration for `image` with the default run command.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Set the PID 1 command.
    #[must_use]
    pub fn with_run_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Expose a host device.
    #[must_use]
    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device.push(device.into());
        self
    }

    /// Add a capability.
    #[must_use]
    pub fn with_cap_add(mut self, cap: impl Into<String>) -> Self {
        self.cap_add.push(cap.into());
        self
    }

    /// Drop a capability.
    #[must_use]
    pub fn with_cap_drop(mut self, cap: impl Into<String>) -> Self {
        self.cap_drop.push(cap.into());
        self
    }

    /// Mount `host` at `container`.
    #[must_use]
    pub fn with_volume(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.volumes.insert(host.into(), container.into());
        self
    }

    /// Add a tmpfs mount.
    #[must_use]
    pub fn with_tmpfs(mut self, mount: impl Into<String>) -> Self {
        self.tmpfs.push(mount.into());
        self
    }

    /// Run privileged.
    #[must_use]
    pub const fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Select a runtime variant.
    #[must_use]
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    /// Select a target platform.
    #[must_use]
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Check the fields the driver depends on.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Config`] if the image is empty.
    pub fn validate(&self) -> KilnResult<()> {
        if self.image.trim().is_empty() {
            return Err(KilnError::Config {
                message: "container image must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// The run command with [`IMAGE_PLACEHOLDER`] expanded.
    #[must_use]
    pub fn rendered_run_command(&self) -> Vec<String> {
        self.run_command
            .iter()
            .map(|arg| arg.replace(IMAGE_PLACEHOLDER, &self.image))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runs_a_shell() {
        let config = ContainerConfig::new("base:1.0");
        assert_eq!(config.run_command, vec!["/bin/sh"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_image_is_rejected() {
        let err = ContainerConfig::new("  ").validate().unwrap_err();
        assert!(matches!(err, KilnError::Config { .. }));
    }

    #[test]
    fn placeholder_is_expanded() {
        let config = ContainerConfig::new("base:1.0")
            .with_run_command(["/bin/sh", "-c", "echo built from {{.Image}}"]);
        assert_eq!(
            config.rendered_run_command(),
            vec!["/bin/sh", "-c", "echo built from base:1.0"]
        );
    }

    #[test]
    fn deserializes_partial_toml() {
        let config: ContainerConfig = toml::from_str(
            r#"
            image = "debian:bookworm"
            privileged = true
            cap_add = ["SYS_ADMIN"]

            [volumes]
            "/tmp/cache" = "/cache"
            "#,
        )
        .unwrap();

        assert_eq!(config.image, "debian:bookworm");
        assert!(config.privileged);
        assert_eq!(config.run_command, vec!["/bin/sh"]);
        assert_eq!(config.volumes.get("/tmp/cache").map(String::as_str), Some("/cache"));
    }
}
