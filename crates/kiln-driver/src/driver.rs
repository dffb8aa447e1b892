//! The driver contract.

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use kiln_common::{ContainerId, Digest, ImageId, KilnResult, RepoDigest, RuntimeVersion};
use tokio::io::AsyncWrite;

use crate::container::ContainerConfig;

/// Byte sink for exported and saved archives.
pub type ArchiveSink<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// Operations a build pipeline needs from a container runtime.
///
/// Every method returns its failure to the caller: implementations never
/// retry and never recover silently. The only stateful pair is
/// [`login`](Self::login)/[`logout`](Self::logout), which bracket a single
/// registry session per driver. Callers must log out on every exit path
/// once a login succeeded; [`with_login`](crate::with_login) does that.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Create and start a container, returning its ID.
    ///
    /// A container that was created but failed to start is removed before
    /// the error is returned.
    async fn start_container(&self, config: &ContainerConfig) -> KilnResult<ContainerId>;

    /// Forcibly stop a container and remove it.
    async fn kill_container(&self, id: &ContainerId) -> KilnResult<()>;

    /// Stop a container within the grace period, then remove it.
    async fn stop_container(&self, id: &ContainerId) -> KilnResult<()>;

    /// Externally reachable address of a running container.
    async fn ip_address(&self, id: &ContainerId) -> KilnResult<IpAddr>;

    /// Freeze the container filesystem into a new image.
    ///
    /// `changes` are image-config deltas (`ENV K=V`, `ENTRYPOINT [...]`).
    /// Empty `author` and `message` leave the metadata unset.
    async fn commit(
        &self,
        id: &ContainerId,
        author: &str,
        changes: &[String],
        message: &str,
    ) -> KilnResult<ImageId>;

    /// Stream the container filesystem as a tar archive into `dst`.
    ///
    /// Write errors of `dst` are returned unchanged.
    async fn export(&self, id: &ContainerId, dst: &mut ArchiveSink<'_>) -> KilnResult<()>;

    /// Create an image from the archive at `path` and tag it into `repo`.
    async fn import(
        &self,
        path: &Path,
        changes: &[String],
        repo: &str,
        platform: Option<&str>,
    ) -> KilnResult<ImageId>;

    /// Stream the full image into `dst`.
    async fn save_image(&self, id: &ImageId, dst: &mut ArchiveSink<'_>) -> KilnResult<()>;

    /// Runtime-local content ID of an image.
    async fn sha256(&self, id: &ImageId) -> KilnResult<Digest>;

    /// Registry digest of an image; `None` if it was never pushed or pulled.
    async fn digest(&self, id: &ImageId) -> KilnResult<Option<RepoDigest>>;

    /// Remove an image reference.
    async fn delete_image(&self, id: &ImageId) -> KilnResult<()>;

    /// Point `repo` at image `id`.
    ///
    /// Without `force`, a reference already bound to a different image
    /// is a conflict.
    async fn tag_image(&self, id: &ImageId, repo: &str, force: bool) -> KilnResult<()>;

    /// Open the registry session for `repo`'s registry.
    async fn login(&self, repo: &str, username: &str, password: &str) -> KilnResult<()>;

    /// Close the session opened by [`login`](Self::login).
    async fn logout(&self, repo: &str) -> KilnResult<()>;

    /// Fetch `image` for `platform` from its registry.
    async fn pull(&self, image: &str, platform: Option<&str>) -> KilnResult<()>;

    /// Upload the local image `name` to its registry.
    async fn push(&self, name: &str, platform: Option<&str>) -> KilnResult<()>;

    /// Cheap readiness probe, run before any lifecycle operation.
    async fn verify(&self) -> KilnResult<()>;

    /// Version of the runtime.
    async fn version(&self) -> KilnResult<RuntimeVersion>;
}
