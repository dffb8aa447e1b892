//! Driver backed by a docker-compatible CLI.
//!
//! Works with `docker` and with `podman` through its docker-compatible
//! command surface. Each operation is one (or, for kill/stop, two)
//! invocations of the runtime binary configured in [`DriverConfig`].

mod command;
mod errors;

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use kiln_common::{
    ContainerId, Digest, ImageId, KilnError, KilnResult, RepoDigest, RuntimeVersion,
};

pub use command::RuntimeCommand;
pub use errors::{Target, classify};

use crate::config::DriverConfig;
use crate::container::ContainerConfig;
use crate::driver::{ArchiveSink, Driver};
use crate::reference::ImageReference;
use crate::session::{RegistrySession, SessionState};

/// Runtimes before this version need `-f` to move an existing tag.
const LEGACY_FORCE_TAG_BEFORE: &str = "1.12.0";

/// Prefix of the names given to build containers.
pub const CONTAINER_NAME_PREFIX: &str = "kiln-";

/// Driver that shells out to a docker-compatible runtime.
#[derive(Debug, Default)]
pub struct DockerDriver {
    config: DriverConfig,
    session: RegistrySession,
}

impl DockerDriver {
    /// Create a driver with `config`.
    #[must_use]
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            session: RegistrySession::new(),
        }
    }

    /// The driver configuration.
    #[must_use]
    pub const fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Current registry session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    fn command<'a>(&'a self, subcommand: &'static str, target: Target<'a>) -> RuntimeCommand<'a> {
        RuntimeCommand::new(&self.config.binary, subcommand, target)
    }

    /// Arguments of the `run` invocation for `config`, naming the container `name`.
    #[must_use]
    pub fn run_args(config: &ContainerConfig, name: &str) -> Vec<String> {
        let mut args: Vec<String> = ["--detach", "--interactive", "--tty", "--name", name]
            .iter()
            .map(ToString::to_string)
            .collect();

        if config.privileged {
            args.push("--privileged".to_string());
        }
        let lists = [
            ("--tmpfs", &config.tmpfs),
            ("--device", &config.device),
            ("--cap-add", &config.cap_add),
            ("--cap-drop", &config.cap_drop),
        ];
        for (flag, values) in lists {
            for value in values {
                args.push(flag.to_string());
                args.push(value.clone());
            }
        }
        for (host, container) in &config.volumes {
            args.push("--volume".to_string());
            args.push(format!("{host}:{container}"));
        }
        if let Some(runtime) = config.runtime.as_deref().filter(|r| !r.is_empty()) {
            args.push(format!("--runtime={runtime}"));
        }
        if let Some(platform) = config.platform.as_deref().filter(|p| !p.is_empty()) {
            args.push(format!("--platform={platform}"));
        }

        let mut command = config.rendered_run_command().into_iter();
        if let Some(entrypoint) = command.next() {
            args.push(format!("--entrypoint={entrypoint}"));
        }
        args.push("--".to_string());
        args.push(config.image.clone());
        args.extend(command);
        args
    }

    /// Force-remove `name`, logging instead of failing.
    async fn discard_container(&self, name: &str) {
        let removed = self
            .command("rm", Target::Container(name))
            .args(["--force", "--volumes", name])
            .output()
            .await;

        match removed {
            Ok(_) => tracing::debug!(container = name, "Removed partially started container"),
            Err(KilnError::ContainerNotFound { .. }) => {}
            Err(err) => {
                tracing::warn!(container = name, error = %err, "Failed to remove partially started container");
            }
        }
    }

    async fn remove_container(&self, id: &ContainerId) -> KilnResult<()> {
        self.command("rm", Target::Container(id.as_str()))
            .arg(id.as_str())
            .output()
            .await?;
        Ok(())
    }

    async fn inspect_image(&self, reference: &str, format: &str) -> KilnResult<String> {
        self.command("inspect", Target::Image(reference))
            .args(["--type", "image", "--format", format, reference])
            .output()
            .await
    }
}

/// Content id from `inspect --format {{.Id}}`; podman prints bare sha256 hex.
fn content_id(output: &str) -> KilnResult<Digest> {
    let output = output.trim();
    if output.contains(':') {
        output.parse()
    } else {
        format!("sha256:{output}").parse()
    }
}

/// Server argument for `login`/`logout`; the runtime's default is Docker Hub.
fn server_argument(registry: &str) -> Option<&str> {
    (registry != ImageReference::DEFAULT_REGISTRY).then_some(registry)
}

#[async_trait]
impl Driver for DockerDriver {
    async fn start_container(&self, config: &ContainerConfig) -> KilnResult<ContainerId> {
        config.validate()?;

        let name = format!("{CONTAINER_NAME_PREFIX}{}", ContainerId::generate());
        tracing::info!(image = %config.image, container = %name, "Starting container");

        let started = self
            .command("run", Target::Remote(&config.image))
            .args(Self::run_args(config, &name))
            .output()
            .await
            .and_then(|stdout| ContainerId::new(stdout.lines().last().unwrap_or_default().trim()));

        match started {
            Ok(id) => {
                tracing::info!(container = %id.short(), "Container started");
                Ok(id)
            }
            Err(err) => {
                self.discard_container(&name).await;
                Err(err)
            }
        }
    }

    async fn kill_container(&self, id: &ContainerId) -> KilnResult<()> {
        self.command("kill", Target::Container(id.as_str()))
            .arg(id.as_str())
            .output()
            .await?;
        self.remove_container(id).await
    }

    async fn stop_container(&self, id: &ContainerId) -> KilnResult<()> {
        self.command("stop", Target::Container(id.as_str()))
            .arg("--time")
            .arg(self.config.stop_timeout.to_string())
            .arg(id.as_str())
            .output()
            .await?;
        self.remove_container(id).await
    }

    async fn ip_address(&self, id: &ContainerId) -> KilnResult<IpAddr> {
        let inspected = self
            .command("inspect", Target::Container(id.as_str()))
            .args([
                "--type",
                "container",
                "--format",
                "{{.State.Running}}|{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                id.as_str(),
            ])
            .output()
            .await?;

        let (running, addresses) = inspected
            .split_once('|')
            .unwrap_or((inspected.as_str(), ""));
        if running.trim() != "true" {
            return Err(KilnError::ContainerNotRunning {
                id: id.to_string(),
            });
        }

        let address = addresses
            .split_whitespace()
            .next()
            .ok_or_else(|| KilnError::NoNetworkAddress { id: id.to_string() })?;

        address.parse().map_err(|_| KilnError::Internal {
            message: format!("runtime reported an invalid address: {address}"),
        })
    }

    async fn commit(
        &self,
        id: &ContainerId,
        author: &str,
        changes: &[String],
        message: &str,
    ) -> KilnResult<ImageId> {
        let image = self
            .command("commit", Target::Container(id.as_str()))
            .optional("--author", Some(author))
            .optional("--message", Some(message))
            .repeated("--change", changes)
            .arg(id.as_str())
            .output()
            .await?;

        tracing::info!(container = %id.short(), image = %image, "Container committed");
        Ok(ImageId::new(image))
    }

    async fn export(&self, id: &ContainerId, dst: &mut ArchiveSink<'_>) -> KilnResult<()> {
        let bytes = self
            .command("export", Target::Container(id.as_str()))
            .arg(id.as_str())
            .stream_to(dst)
            .await?;

        tracing::info!(container = %id.short(), bytes, "Container exported");
        Ok(())
    }

    async fn import(
        &self,
        path: &Path,
        changes: &[String],
        repo: &str,
        platform: Option<&str>,
    ) -> KilnResult<ImageId> {
        let image = self
            .command("import", Target::Image(repo))
            .repeated("--change", changes)
            .optional("--platform", platform)
            .args(["-", repo])
            .output_with_file(path)
            .await?;

        tracing::info!(path = %path.display(), repo, image = %image, "Archive imported");
        Ok(ImageId::new(image))
    }

    async fn save_image(&self, id: &ImageId, dst: &mut ArchiveSink<'_>) -> KilnResult<()> {
        let bytes = self
            .command("save", Target::Image(id.as_str()))
            .arg(id.as_str())
            .stream_to(dst)
            .await?;

        tracing::info!(image = %id, bytes, "Image saved");
        Ok(())
    }

    async fn sha256(&self, id: &ImageId) -> KilnResult<Digest> {
        content_id(&self.inspect_image(id.as_str(), "{{.Id}}").await?)
    }

    async fn digest(&self, id: &ImageId) -> KilnResult<Option<RepoDigest>> {
        let digests = self
            .inspect_image(id.as_str(), "{{range .RepoDigests}}{{println .}}{{end}}")
            .await?;

        digests
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::parse)
            .transpose()
    }

    async fn delete_image(&self, id: &ImageId) -> KilnResult<()> {
        self.command("rmi", Target::Image(id.as_str()))
            .arg(id.as_str())
            .output()
            .await?;

        tracing::info!(image = %id, "Image deleted");
        Ok(())
    }

    async fn tag_image(&self, id: &ImageId, repo: &str, force: bool) -> KilnResult<()> {
        let mut legacy_force = false;

        if force {
            let legacy = RuntimeVersion::parse(LEGACY_FORCE_TAG_BEFORE)?;
            legacy_force = !self.version().await?.at_least(&legacy);
        } else {
            match self.inspect_image(repo, "{{.Id}}").await {
                Ok(existing) => {
                    let existing = content_id(&existing)?;
                    if existing != self.sha256(id).await? {
                        return Err(KilnError::TagConflict {
                            reference: repo.to_string(),
                            existing: existing.to_string(),
                        });
                    }
                }
                Err(KilnError::ImageNotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        let mut command = self.command("tag", Target::Image(id.as_str()));
        if legacy_force {
            command = command.arg("-f");
        }
        command.args([id.as_str(), repo]).output().await?;

        tracing::info!(image = %id, repo, force, "Image tagged");
        Ok(())
    }

    async fn login(&self, repo: &str, username: &str, password: &str) -> KilnResult<()> {
        let pending = self.session.begin_login(repo)?;
        let registry = pending.registry().to_string();

        let mut command = self
            .command("login", Target::Registry(&registry))
            .args(["--username", username, "--password-stdin"]);
        if let Some(server) = server_argument(&registry) {
            command = command.arg(server);
        }

        let outcome = command.output_with_input(password.as_bytes()).await;
        pending.finish(outcome).map(|_| ())
    }

    async fn logout(&self, repo: &str) -> KilnResult<()> {
        let registry = self.session.logout(repo)?;

        let mut command = self.command("logout", Target::Registry(&registry));
        if let Some(server) = server_argument(&registry) {
            command = command.arg(server);
        }
        command.output().await?;

        tracing::info!(registry = %registry, "Registry session closed");
        Ok(())
    }

    async fn pull(&self, image: &str, platform: Option<&str>) -> KilnResult<()> {
        let access = self.session.authorize(image)?;
        tracing::info!(image, ?access, "Pulling image");

        self.command("pull", Target::Remote(image))
            .optional("--platform", platform)
            .arg(image)
            .output()
            .await?;
        Ok(())
    }

    async fn push(&self, name: &str, platform: Option<&str>) -> KilnResult<()> {
        let access = self.session.authorize(name)?;
        tracing::info!(image = name, ?access, "Pushing image");

        self.command("push", Target::Remote(name))
            .optional("--platform", platform)
            .arg(name)
            .output()
            .await?;
        Ok(())
    }

    async fn verify(&self) -> KilnResult<()> {
        let server = self
            .command("version", Target::Runtime)
            .args(["--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|err| match err {
                KilnError::Runtime { stderr, .. } => KilnError::RuntimeUnavailable { message: stderr },
                other => other,
            })?;

        let server = RuntimeVersion::parse(&server).map_err(|_| KilnError::RuntimeUnavailable {
            message: format!("runtime reported no usable server version: {server:?}"),
        })?;

        if let Some(required) = &self.config.min_version {
            if !server.at_least(required) {
                return Err(KilnError::UnsupportedVersion {
                    found: server.to_string(),
                    required: required.to_string(),
                });
            }
        }

        tracing::debug!(version = %server, binary = %self.config.binary.display(), "Runtime verified");
        Ok(())
    }

    async fn version(&self) -> KilnResult<RuntimeVersion> {
        self.command("version", Target::Runtime)
            .args(["--format", "{{.Client.Version}}"])
            .output()
            .await?
            .parse()
    }
}
