//! In-memory driver for tests and dry runs.
//!
//! [`MockDriver`] keeps containers, images, tags and a fake remote registry
//! in memory. Container filesystems are plain path/content maps, so a test
//! can provision a container with [`MockDriver::write_file`], commit it and
//! inspect the exported or saved archive. Every call is captured and any
//! operation can be made to fail with [`MockDriver::fail_on`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use async_trait::async_trait;
use kiln_common::{
    ContainerId, Digest, ImageId, KilnError, KilnResult, RepoDigest, RuntimeVersion,
};
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;

use crate::container::ContainerConfig;
use crate::driver::{ArchiveSink, Driver};
use crate::reference::ImageReference;
use crate::session::{RegistrySession, SessionAccess, SessionState};

/// Version reported by a mock driver unless configured otherwise.
pub const MOCK_VERSION: &str = "24.0.7";

type Files = BTreeMap<String, Vec<u8>>;

/// Driver operations, for call capture and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    /// `start_container`; an injected failure hits after the container exists.
    Start,
    /// `kill_container`.
    Kill,
    /// `stop_container`.
    Stop,
    /// `ip_address`.
    IpAddress,
    /// `commit`.
    Commit,
    /// `export`.
    Export,
    /// `import`.
    Import,
    /// `save_image`.
    Save,
    /// `sha256`.
    Sha256,
    /// `digest`.
    Digest,
    /// `delete_image`.
    Delete,
    /// `tag_image`.
    Tag,
    /// `login`.
    Login,
    /// `logout`.
    Logout,
    /// `pull`.
    Pull,
    /// `push`.
    Push,
    /// `verify`.
    Verify,
    /// `version`.
    Version,
}

impl MockOperation {
    /// Runtime subcommand the operation corresponds to.
    #[must_use]
    pub const fn command(self) -> &'static str {
        match self {
            Self::Start => "run",
            Self::Kill => "kill",
            Self::Stop => "stop",
            Self::IpAddress | Self::Sha256 | Self::Digest => "inspect",
            Self::Commit => "commit",
            Self::Export => "export",
            Self::Import => "import",
            Self::Save => "save",
            Self::Delete => "rmi",
            Self::Tag => "tag",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Verify | Self::Version => "version",
        }
    }
}

/// One captured driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedCall {
    /// The operation.
    pub operation: MockOperation,
    /// Container, image, reference or registry the call was about.
    pub subject: String,
}

/// Metadata of a local mock image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// Commit author, empty if unset.
    pub author: String,
    /// Commit message, empty if unset.
    pub message: String,
    /// Applied config changes.
    pub changes: Vec<String>,
    /// Platform the image was imported or pulled for.
    pub platform: Option<String>,
    /// Paths in the image filesystem.
    pub paths: Vec<String>,
}

#[derive(Debug)]
struct MockContainer {
    image: String,
    running: bool,
    address: IpAddr,
    files: Files,
}

#[derive(Debug, Clone, Default)]
struct MockImage {
    files: Files,
    changes: Vec<String>,
    author: String,
    message: String,
    platform: Option<String>,
    repo_digests: Vec<RepoDigest>,
}

#[derive(Debug, Clone)]
struct RemoteImage {
    files: Files,
    changes: Vec<String>,
    digest: Digest,
}

#[derive(Debug)]
struct MockState {
    containers: HashMap<ContainerId, MockContainer>,
    images: HashMap<String, MockImage>,
    tags: HashMap<String, String>,
    remote: HashMap<String, RemoteImage>,
    private_registries: HashSet<String>,
    credentials: HashMap<String, (String, String)>,
    failures: HashSet<MockOperation>,
    calls: Vec<CapturedCall>,
    available: bool,
    version: RuntimeVersion,
    serial: u64,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            containers: HashMap::new(),
            images: HashMap::new(),
            tags: HashMap::new(),
            remote: HashMap::new(),
            private_registries: HashSet::new(),
            credentials: HashMap::new(),
            failures: HashSet::new(),
            calls: Vec::new(),
            available: true,
            version: RuntimeVersion::parse(MOCK_VERSION)
                .unwrap_or_else(|_| unreachable!("MOCK_VERSION is a valid version")),
            serial: 0,
        }
    }
}

impl MockState {
    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    /// Image key for an id or a tag reference.
    fn resolve(&self, id: &str) -> Option<String> {
        if self.images.contains_key(id) {
            return Some(id.to_string());
        }
        let reference = ImageReference::parse(id).ok()?.full_reference();
        self.tags.get(&reference).cloned()
    }

    fn resolve_or_missing(&self, id: &str) -> KilnResult<String> {
        self.resolve(id).ok_or_else(|| KilnError::ImageNotFound {
            reference: id.to_string(),
        })
    }

    fn image(&self, key: &str) -> KilnResult<&MockImage> {
        self.images.get(key).ok_or_else(|| KilnError::ImageNotFound {
            reference: key.to_string(),
        })
    }

    fn container(&self, id: &ContainerId) -> KilnResult<&MockContainer> {
        self.containers
            .get(id)
            .ok_or_else(|| KilnError::ContainerNotFound { id: id.to_string() })
    }

    fn in_use(&self, key: &str) -> bool {
        self.containers.values().any(|c| c.image == key)
    }

    fn tags_of(&self, key: &str) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .filter(|(_, image)| image.as_str() == key)
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.sort();
        tags
    }

    fn is_private(&self, registry: &str) -> bool {
        self.private_registries.contains(registry)
    }

    /// Store `image` under a fresh id and return the id.
    fn insert_image(&mut self, image: MockImage) -> String {
        let serial = self.next_serial();
        let key = content_digest(&image.files, &image.changes, &serial.to_be_bytes()).to_string();
        self.images.insert(key.clone(), image);
        key
    }
}

/// Content digest of a filesystem plus config changes.
fn content_digest(files: &Files, changes: &[String], salt: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    for (path, data) in files {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update((data.len() as u64).to_be_bytes());
        hasher.update(data);
    }
    for change in changes {
        hasher.update(change.as_bytes());
        hasher.update([0]);
    }
    hasher.update(salt);
    Digest::sha256(hex::encode(hasher.finalize()))
}

fn archive(files: &Files) -> KilnResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path.trim_start_matches('/'), data.as_slice())?;
    }
    Ok(builder.into_inner()?)
}

fn unpack(bytes: &[u8]) -> KilnResult<Files> {
    let mut files = Files::new();
    let mut archive = tar::Archive::new(bytes);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = format!("/{}", entry.path()?.to_string_lossy());
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.insert(path, data);
    }
    Ok(files)
}

async fn write_archive(dst: &mut ArchiveSink<'_>, bytes: &[u8]) -> KilnResult<()> {
    dst.write_all(bytes).await?;
    dst.flush().await?;
    Ok(())
}

/// In-memory [`Driver`].
#[derive(Debug, Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
    session: RegistrySession,
}

impl MockDriver {
    /// Create an empty mock with a public `docker.io`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Require an authenticated session for pushes and pulls to `registry`.
    #[must_use]
    pub fn with_private_registry(self, registry: impl Into<String>) -> Self {
        self.state.lock().private_registries.insert(registry.into());
        self
    }

    /// Accept only these credentials when logging into `registry`.
    ///
    /// Registries without credentials accept any login.
    #[must_use]
    pub fn with_credentials(
        self,
        registry: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.state
            .lock()
            .credentials
            .insert(registry.into(), (username.into(), password.into()));
        self
    }

    /// Report `version` from [`Driver::version`].
    #[must_use]
    pub fn with_version(self, version: RuntimeVersion) -> Self {
        self.state.lock().version = version;
        self
    }

    /// Make the runtime (un)reachable.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Make every later call of `operation` fail.
    pub fn fail_on(&self, operation: MockOperation) {
        self.state.lock().failures.insert(operation);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Seed the fake registry with an image at `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if `reference` cannot be parsed.
    pub fn publish_remote<I, P>(&self, reference: &str, files: I) -> KilnResult<Digest>
    where
        I: IntoIterator<Item = (P, Vec<u8>)>,
        P: Into<String>,
    {
        let reference = ImageReference::parse(reference)?.full_reference();
        let files: Files = files.into_iter().map(|(p, d)| (p.into(), d)).collect();
        let digest = content_digest(&files, &[], b"");

        self.state.lock().remote.insert(
            reference,
            RemoteImage {
                files,
                changes: Vec::new(),
                digest: digest.clone(),
            },
        );
        Ok(digest)
    }

    /// Digest of the image at `reference` in the fake registry.
    #[must_use]
    pub fn remote_digest(&self, reference: &str) -> Option<Digest> {
        let reference = ImageReference::parse(reference).ok()?.full_reference();
        self.state
            .lock()
            .remote
            .get(&reference)
            .map(|image| image.digest.clone())
    }

    /// Write a file into a running container, standing in for provisioning.
    ///
    /// # Errors
    ///
    /// Returns an error if the container does not exist or is not running.
    pub fn write_file(
        &self,
        id: &ContainerId,
        path: impl Into<String>,
        contents: impl Into<Vec<u8>>,
    ) -> KilnResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| KilnError::ContainerNotFound { id: id.to_string() })?;
        if !container.running {
            return Err(KilnError::ContainerNotRunning { id: id.to_string() });
        }
        container.files.insert(path.into(), contents.into());
        Ok(())
    }

    /// Mark a container's main process as exited. The container stays
    /// present, so it can still be stopped, committed and exported.
    ///
    /// # Errors
    ///
    /// Returns an error if the container does not exist.
    pub fn halt(&self, id: &ContainerId) -> KilnResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| KilnError::ContainerNotFound { id: id.to_string() })?;
        container.running = false;
        tracing::debug!(container = %id, "Mock container halted");
        Ok(())
    }

    /// Number of live containers.
    #[must_use]
    pub fn container_count(&self) -> usize {
        self.state.lock().containers.len()
    }

    /// Number of local images.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Metadata of the local image `id` (an id or a tag).
    #[must_use]
    pub fn image_record(&self, id: &str) -> Option<ImageRecord> {
        let state = self.state.lock();
        let image = state.images.get(&state.resolve(id)?)?;
        Some(ImageRecord {
            author: image.author.clone(),
            message: image.message.clone(),
            changes: image.changes.clone(),
            platform: image.platform.clone(),
            paths: image.files.keys().cloned().collect(),
        })
    }

    /// Calls made so far, oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<CapturedCall> {
        self.state.lock().calls.clone()
    }

    /// Current registry session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    fn record(&self, operation: MockOperation, subject: &str) -> KilnResult<()> {
        let mut state = self.state.lock();
        state.calls.push(CapturedCall {
            operation,
            subject: subject.to_string(),
        });

        if !state.available {
            return Err(KilnError::RuntimeUnavailable {
                message: "mock runtime is unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn injected(&self, operation: MockOperation) -> KilnResult<()> {
        if self.state.lock().failures.contains(&operation) {
            return Err(KilnError::Runtime {
                command: operation.command().to_string(),
                status: Some(1),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn enter(&self, operation: MockOperation, subject: &str) -> KilnResult<()> {
        self.record(operation, subject)?;
        self.injected(operation)
    }

    /// Local image key for `image`, pulling it from the fake registry if needed.
    fn ensure_local(&self, image: &str) -> KilnResult<String> {
        if let Some(key) = self.state.lock().resolve(image) {
            return Ok(key);
        }
        let access = self.session.authorize(image)?;
        self.materialize(image, None, access)
    }

    fn materialize(
        &self,
        image: &str,
        platform: Option<&str>,
        access: SessionAccess,
    ) -> KilnResult<String> {
        let reference = ImageReference::parse(image)?;
        let full = reference.full_reference();
        let mut state = self.state.lock();

        let remote = state
            .remote
            .get(&full)
            .cloned()
            .ok_or_else(|| KilnError::ImageNotFound {
                reference: image.to_string(),
            })?;
        if state.is_private(&reference.registry) && access != SessionAccess::Authenticated {
            return Err(KilnError::Auth {
                registry: reference.registry,
                message: "pull access denied".to_string(),
            });
        }

        let key = content_digest(&remote.files, &remote.changes, b"pulled").to_string();
        let repo_digest = RepoDigest {
            repository: format!("{}/{}", reference.registry, reference.repository),
            digest: remote.digest,
        };

        let local = state.images.entry(key.clone()).or_insert_with(|| MockImage {
            files: remote.files,
            changes: remote.changes,
            ..MockImage::default()
        });
        local.platform = platform.map(ToString::to_string);
        if !local.repo_digests.contains(&repo_digest) {
            local.repo_digests.push(repo_digest);
        }
        state.tags.insert(full, key.clone());

        tracing::info!(image, key = %key, "Mock image pulled");
        Ok(key)
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn start_container(&self, config: &ContainerConfig) -> KilnResult<ContainerId> {
        self.record(MockOperation::Start, &config.image)?;
        config.validate()?;

        let image = self.ensure_local(&config.image)?;
        let id = ContainerId::generate();
        {
            let mut state = self.state.lock();
            let files = state.image(&image)?.files.clone();
            let octet = u8::try_from(state.containers.len() % 250).unwrap_or_default() + 2;
            state.containers.insert(
                id.clone(),
                MockContainer {
                    image,
                    running: true,
                    address: IpAddr::V4(Ipv4Addr::new(172, 17, 0, octet)),
                    files,
                },
            );
        }

        if let Err(err) = self.injected(MockOperation::Start) {
            self.state.lock().containers.remove(&id);
            tracing::debug!(container = %id, "Removed container after failed start");
            return Err(err);
        }

        tracing::info!(container = %id, image = %config.image, "Mock container started");
        Ok(id)
    }

    async fn kill_container(&self, id: &ContainerId) -> KilnResult<()> {
        self.enter(MockOperation::Kill, id.as_str())?;

        let mut state = self.state.lock();
        if !state.container(id)?.running {
            return Err(KilnError::ContainerNotRunning { id: id.to_string() });
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn stop_container(&self, id: &ContainerId) -> KilnResult<()> {
        self.enter(MockOperation::Stop, id.as_str())?;

        let mut state = self.state.lock();
        state.container(id)?;
        state.containers.remove(id);
        Ok(())
    }

    async fn ip_address(&self, id: &ContainerId) -> KilnResult<IpAddr> {
        self.enter(MockOperation::IpAddress, id.as_str())?;

        let state = self.state.lock();
        let container = state.container(id)?;
        if !container.running {
            return Err(KilnError::ContainerNotRunning { id: id.to_string() });
        }
        Ok(container.address)
    }

    async fn commit(
        &self,
        id: &ContainerId,
        author: &str,
        changes: &[String],
        message: &str,
    ) -> KilnResult<ImageId> {
        self.enter(MockOperation::Commit, id.as_str())?;

        let mut state = self.state.lock();
        let container = state.container(id)?;
        let base = state.image(&container.image)?;

        let mut applied = base.changes.clone();
        applied.extend_from_slice(changes);
        let image = MockImage {
            files: container.files.clone(),
            changes: applied,
            author: author.to_string(),
            message: message.to_string(),
            platform: base.platform.clone(),
            repo_digests: Vec::new(),
        };
        let key = state.insert_image(image);

        tracing::info!(container = %id, image = %key, "Mock container committed");
        Ok(ImageId::new(key))
    }

    async fn export(&self, id: &ContainerId, dst: &mut ArchiveSink<'_>) -> KilnResult<()> {
        self.enter(MockOperation::Export, id.as_str())?;

        let bytes = {
            let state = self.state.lock();
            archive(&state.container(id)?.files)?
        };
        write_archive(dst, &bytes).await
    }

    async fn import(
        &self,
        path: &Path,
        changes: &[String],
        repo: &str,
        platform: Option<&str>,
    ) -> KilnResult<ImageId> {
        self.enter(MockOperation::Import, repo)?;

        let bytes = tokio::fs::read(path).await?;
        let files = unpack(&bytes)?;
        let reference = if repo.is_empty() {
            None
        } else {
            Some(ImageReference::parse(repo)?.full_reference())
        };

        let mut state = self.state.lock();
        let key = state.insert_image(MockImage {
            files,
            changes: changes.to_vec(),
            platform: platform.map(ToString::to_string),
            ..MockImage::default()
        });
        if let Some(reference) = reference {
            state.tags.insert(reference, key.clone());
        }

        tracing::info!(path = %path.display(), image = %key, "Mock archive imported");
        Ok(ImageId::new(key))
    }

    async fn save_image(&self, id: &ImageId, dst: &mut ArchiveSink<'_>) -> KilnResult<()> {
        self.enter(MockOperation::Save, id.as_str())?;

        let bytes = {
            let state = self.state.lock();
            let key = state.resolve_or_missing(id.as_str())?;
            let image = state.image(&key)?;

            let manifest = serde_json::json!([{
                "Config": key,
                "RepoTags": state.tags_of(&key),
                "Changes": image.changes,
                "Layers": ["layer.tar"],
            }]);

            let mut files = Files::new();
            files.insert("manifest.json".to_string(), serde_json::to_vec_pretty(&manifest)?);
            files.insert("layer.tar".to_string(), archive(&image.files)?);
            archive(&files)?
        };
        write_archive(dst, &bytes).await
    }

    async fn sha256(&self, id: &ImageId) -> KilnResult<Digest> {
        self.enter(MockOperation::Sha256, id.as_str())?;
        self.state.lock().resolve_or_missing(id.as_str())?.parse()
    }

    async fn digest(&self, id: &ImageId) -> KilnResult<Option<RepoDigest>> {
        self.enter(MockOperation::Digest, id.as_str())?;

        let state = self.state.lock();
        let key = state.resolve_or_missing(id.as_str())?;
        Ok(state.image(&key)?.repo_digests.first().cloned())
    }

    async fn delete_image(&self, id: &ImageId) -> KilnResult<()> {
        self.enter(MockOperation::Delete, id.as_str())?;

        let mut state = self.state.lock();
        let key = state.resolve_or_missing(id.as_str())?;
        let by_tag = key != id.as_str();

        if by_tag {
            let reference = ImageReference::parse(id.as_str())?.full_reference();
            if state.tags_of(&key).len() > 1 {
                state.tags.remove(&reference);
                return Ok(());
            }
        }
        if state.in_use(&key) {
            return Err(KilnError::ImageInUse {
                reference: id.to_string(),
                message: "image is being used by a container".to_string(),
            });
        }

        state.tags.retain(|_, image| *image != key);
        state.images.remove(&key);
        tracing::info!(image = %key, "Mock image deleted");
        Ok(())
    }

    async fn tag_image(&self, id: &ImageId, repo: &str, force: bool) -> KilnResult<()> {
        self.enter(MockOperation::Tag, repo)?;

        let mut state = self.state.lock();
        let key = state.resolve_or_missing(id.as_str())?;
        let reference = ImageReference::parse(repo)?.full_reference();

        if let Some(existing) = state.tags.get(&reference) {
            if *existing != key && !force {
                return Err(KilnError::TagConflict {
                    reference: repo.to_string(),
                    existing: existing.clone(),
                });
            }
        }
        state.tags.insert(reference, key);
        Ok(())
    }

    async fn login(&self, repo: &str, username: &str, password: &str) -> KilnResult<()> {
        self.enter(MockOperation::Login, repo)?;

        let pending = self.session.begin_login(repo)?;
        let outcome = match self.state.lock().credentials.get(pending.registry()) {
            Some((user, pass)) if user != username || pass != password => Err(KilnError::Auth {
                registry: pending.registry().to_string(),
                message: "incorrect username or password".to_string(),
            }),
            _ => Ok(()),
        };
        pending.finish(outcome)
    }

    async fn logout(&self, repo: &str) -> KilnResult<()> {
        self.record(MockOperation::Logout, repo)?;
        self.session.logout(repo)?;
        self.injected(MockOperation::Logout)
    }

    async fn pull(&self, image: &str, platform: Option<&str>) -> KilnResult<()> {
        self.enter(MockOperation::Pull, image)?;

        let access = self.session.authorize(image)?;
        self.materialize(image, platform, access)?;
        Ok(())
    }

    async fn push(&self, name: &str, _platform: Option<&str>) -> KilnResult<()> {
        self.enter(MockOperation::Push, name)?;

        let access = self.session.authorize(name)?;
        let reference = ImageReference::parse(name)?;
        let full = reference.full_reference();
        let mut state = self.state.lock();

        let key = state
            .tags
            .get(&full)
            .cloned()
            .ok_or_else(|| KilnError::ImageNotFound {
                reference: name.to_string(),
            })?;
        if state.is_private(&reference.registry) && access != SessionAccess::Authenticated {
            return Err(KilnError::Auth {
                registry: reference.registry,
                message: "authentication required".to_string(),
            });
        }

        let image = state.image(&key)?;
        let digest = content_digest(&image.files, &image.changes, b"");
        let remote = RemoteImage {
            files: image.files.clone(),
            changes: image.changes.clone(),
            digest: digest.clone(),
        };

        let unchanged = state
            .remote
            .get(&full)
            .is_some_and(|existing| existing.digest == digest);
        if !unchanged {
            state.remote.insert(full, remote);
        }

        let repo_digest = RepoDigest {
            repository: format!("{}/{}", reference.registry, reference.repository),
            digest,
        };
        if let Some(image) = state.images.get_mut(&key) {
            if !image.repo_digests.contains(&repo_digest) {
                image.repo_digests.push(repo_digest);
            }
        }

        tracing::info!(image = name, unchanged, "Mock image pushed");
        Ok(())
    }

    async fn verify(&self) -> KilnResult<()> {
        self.record(MockOperation::Verify, "")?;
        self.injected(MockOperation::Verify)
            .map_err(|err| KilnError::RuntimeUnavailable {
                message: err.to_string(),
            })
    }

    async fn version(&self) -> KilnResult<RuntimeVersion> {
        self.enter(MockOperation::Version, "")?;
        Ok(self.state.lock().version.clone())
    }
}
