//! Integration tests for the in-memory driver.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt;
use kiln_driver::{
    ContainerConfig, Driver, ErrorKind, ImageId, KilnError, MockDriver, MockOperation,
    SessionState, with_login,
};
use tempfile::tempdir;
use tokio::io::AsyncWrite;

/// A sink that accepts `budget` bytes and then fails.
struct FailingWriter {
    budget: usize,
}

impl AsyncWrite for FailingWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.budget == 0 {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink closed")));
        }
        let written = buf.len().min(self.budget);
        self.budget -= written;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A mock with `base:1.0` available locally.
async fn driver_with_base() -> MockDriver {
    let driver = MockDriver::new();
    driver
        .publish_remote("base:1.0", [("/etc/os-release", b"ID=base".to_vec())])
        .unwrap();
    driver.pull("base:1.0", None).await.unwrap();
    driver
}

#[test_log::test(tokio::test)]
async fn test_push_without_login_to_private_registry() {
    let driver = driver_with_base().await.with_private_registry("docker.io");

    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    let image = driver
        .commit(&container, "bob", &[], "build")
        .await
        .unwrap();
    driver.tag_image(&image, "myrepo:1.0", false).await.unwrap();

    let err = driver.push("myrepo:1.0", None).await.unwrap_err();
    assert!(matches!(&err, KilnError::Auth { registry, .. } if registry == "docker.io"));
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(driver.remote_digest("myrepo:1.0").is_none());
}

#[tokio::test]
async fn test_push_inside_session_assigns_digest() {
    let driver = driver_with_base()
        .await
        .with_private_registry("docker.io")
        .with_credentials("docker.io", "bob", "hunter2");

    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    driver
        .write_file(&container, "/opt/app/config", b"mode=release".to_vec())
        .unwrap();
    let image = driver
        .commit(&container, "bob", &["USER app".to_string()], "build")
        .await
        .unwrap();
    driver.tag_image(&image, "myrepo:1.0", false).await.unwrap();
    assert_eq!(driver.digest(&image).await.unwrap(), None);

    driver.login("docker.io", "bob", "hunter2").await.unwrap();
    driver.push("myrepo:1.0", None).await.unwrap();
    // Same content again is accepted.
    driver.push("myrepo:1.0", None).await.unwrap();
    driver.logout("docker.io").await.unwrap();

    let digest = driver.digest(&image).await.unwrap().unwrap();
    assert_eq!(Some(digest.digest), driver.remote_digest("myrepo:1.0"));
    assert_eq!(digest.repository, "docker.io/library/myrepo");
}

#[tokio::test]
async fn test_commit_records_metadata() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    driver
        .write_file(&container, "/usr/bin/app", vec![0x7f, b'E', b'L', b'F'])
        .unwrap();

    let changes = vec![
        "ENTRYPOINT [\"/usr/bin/app\"]".to_string(),
        "ENV MODE=release".to_string(),
    ];
    let image = driver
        .commit(&container, "", &changes, "")
        .await
        .unwrap();

    let record = driver.image_record(image.as_str()).unwrap();
    assert_eq!(record.author, "");
    assert_eq!(record.message, "");
    assert_eq!(record.changes, changes);
    assert_eq!(record.paths, vec!["/etc/os-release", "/usr/bin/app"]);
}

#[tokio::test]
async fn test_tag_conflict_and_force() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    let first = driver.commit(&container, "", &[], "").await.unwrap();
    let second = driver.commit(&container, "", &[], "").await.unwrap();

    driver.tag_image(&first, "app:latest", false).await.unwrap();
    // Retagging the same image is not a conflict.
    driver.tag_image(&first, "app:latest", false).await.unwrap();

    let err = driver
        .tag_image(&second, "app:latest", false)
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::TagConflict { .. }));
    assert!(err.kind().is_caller_correctable());

    driver.tag_image(&second, "app:latest", true).await.unwrap();
    assert_eq!(
        driver.sha256(&ImageId::new("app")).await.unwrap(),
        driver.sha256(&second).await.unwrap()
    );
}

#[tokio::test]
async fn test_sha256_is_stable() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    let image = driver.commit(&container, "bob", &[], "build").await.unwrap();

    let first = driver.sha256(&image).await.unwrap();
    let second = driver.sha256(&image).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.algorithm, "sha256");
    assert_eq!(first.hash.len(), 64);
}

#[tokio::test]
async fn test_double_login_and_logout_without_login() {
    let driver = MockDriver::new();

    let err = driver.logout("ghcr.io").await.unwrap_err();
    assert!(matches!(err, KilnError::NoSession { .. }));

    driver.login("ghcr.io", "bob", "token").await.unwrap();
    let err = driver.login("ghcr.io", "bob", "token").await.unwrap_err();
    assert!(matches!(err, KilnError::SessionActive { .. }));

    driver.logout("ghcr.io").await.unwrap();
    assert_eq!(driver.session_state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn test_rejected_login_leaves_driver_unauthenticated() {
    let driver = MockDriver::new().with_credentials("ghcr.io", "bob", "right");

    let err = driver.login("ghcr.io", "bob", "wrong").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(driver.session_state(), SessionState::Unauthenticated);

    driver.login("ghcr.io", "bob", "right").await.unwrap();
}

#[tokio::test]
async fn test_session_mismatch() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    let image = driver.commit(&container, "", &[], "").await.unwrap();
    driver
        .tag_image(&image, "quay.io/team/app:1", false)
        .await
        .unwrap();

    driver.login("ghcr.io", "bob", "token").await.unwrap();
    let err = driver.push("quay.io/team/app:1", None).await.unwrap_err();
    assert!(matches!(
        err,
        KilnError::SessionMismatch { active, requested }
            if active == "ghcr.io" && requested == "quay.io"
    ));
    assert!(driver.remote_digest("quay.io/team/app:1").is_none());
}

#[tokio::test]
async fn test_with_login_always_logs_out() {
    let driver = MockDriver::new();

    let result: Result<(), _> = with_login(&driver, "ghcr.io", "bob", "token", |_driver| {
        async move {
            Err::<(), _>(KilnError::Internal {
                message: "provisioner failed".to_string(),
            })
        }
        .boxed()
    })
    .await;

    assert!(matches!(result, Err(KilnError::Internal { .. })));
    assert_eq!(driver.session_state(), SessionState::Unauthenticated);
    let logouts = driver
        .calls()
        .iter()
        .filter(|call| call.operation == MockOperation::Logout)
        .count();
    assert_eq!(logouts, 1);
}

#[tokio::test]
async fn test_with_login_returns_value() {
    let driver = driver_with_base().await;

    let version = with_login(&driver, "", "bob", "token", |driver| {
        async move {
            driver.pull("base:1.0", None).await?;
            driver.version().await
        }
        .boxed()
    })
    .await
    .unwrap();

    assert_eq!(version.to_string(), kiln_driver::mock::MOCK_VERSION);
    assert_eq!(driver.session_state(), SessionState::Unauthenticated);
}

#[test_log::test(tokio::test)]
async fn test_with_login_on_tagged_docker_hub_name() {
    let driver = driver_with_base()
        .await
        .with_private_registry("docker.io")
        .with_credentials("docker.io", "bob", "hunter2");
    driver
        .tag_image(&ImageId::new("base:1.0"), "myrepo:1.0", false)
        .await
        .unwrap();

    with_login(&driver, "myrepo:1.0", "bob", "hunter2", |driver| {
        async move { driver.push("myrepo:1.0", None).await }.boxed()
    })
    .await
    .unwrap();

    assert!(driver.remote_digest("myrepo:1.0").is_some());
    assert_eq!(driver.session_state(), SessionState::Unauthenticated);
}

#[tokio::test]
async fn test_failed_start_leaves_no_container() {
    let driver = driver_with_base().await;
    driver.fail_on(MockOperation::Start);

    let err = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(driver.container_count(), 0);

    driver.clear_failures();
    driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    assert_eq!(driver.container_count(), 1);
}

#[tokio::test]
async fn test_start_errors() {
    let driver = MockDriver::new();

    let err = driver
        .start_container(&ContainerConfig::new("missing:1.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::ImageNotFound { .. }));

    let err = driver
        .start_container(&ContainerConfig::new(""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);

    driver.set_available(false);
    let err = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RuntimeUnavailable);
    assert_eq!(driver.container_count(), 0);
}

#[tokio::test]
async fn test_lifecycle_removes_containers() {
    let driver = driver_with_base().await;
    let config = ContainerConfig::new("base:1.0");

    let killed = driver.start_container(&config).await.unwrap();
    let stopped = driver.start_container(&config).await.unwrap();
    assert!(driver.ip_address(&killed).await.unwrap().is_ipv4());

    driver.kill_container(&killed).await.unwrap();
    driver.stop_container(&stopped).await.unwrap();
    assert_eq!(driver.container_count(), 0);

    let err = driver.ip_address(&killed).await.unwrap_err();
    assert!(matches!(err, KilnError::ContainerNotFound { .. }));
    let err = driver.commit(&stopped, "", &[], "").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_halted_container_is_not_running() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    driver.halt(&container).unwrap();

    let err = driver.ip_address(&container).await.unwrap_err();
    assert!(matches!(err, KilnError::ContainerNotRunning { .. }));
    let err = driver.kill_container(&container).await.unwrap_err();
    assert!(matches!(err, KilnError::ContainerNotRunning { .. }));
    let err = driver
        .write_file(&container, "/tmp/late", b"x".to_vec())
        .unwrap_err();
    assert!(matches!(err, KilnError::ContainerNotRunning { .. }));
    assert_eq!(driver.container_count(), 1);

    // The filesystem survives the exit and the container can still be stopped.
    let image = driver.commit(&container, "", &[], "").await.unwrap();
    assert!(driver.image_record(image.as_str()).is_some());
    driver.stop_container(&container).await.unwrap();
    assert_eq!(driver.container_count(), 0);
}

#[tokio::test]
async fn test_export_streams_container_filesystem() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    driver
        .write_file(&container, "/srv/index.html", b"<h1>ok</h1>".to_vec())
        .unwrap();

    let mut archive = Vec::new();
    driver.export(&container, &mut archive).await.unwrap();

    let mut paths: Vec<String> = tar::Archive::new(archive.as_slice())
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().display().to_string())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["etc/os-release", "srv/index.html"]);
}

#[tokio::test]
async fn test_export_propagates_writer_errors() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();

    let mut sink = FailingWriter { budget: 100 };
    let err = driver.export(&container, &mut sink).await.unwrap_err();
    assert!(matches!(&err, KilnError::Io(io) if io.kind() == io::ErrorKind::BrokenPipe));
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[tokio::test]
async fn test_import_and_save() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("rootfs.tar");

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(5);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "bin/hello", &b"hello"[..])
        .unwrap();
    std::fs::write(&path, builder.into_inner().unwrap()).unwrap();

    let driver = MockDriver::new();
    let image = driver
        .import(&path, &["CMD [\"/bin/hello\"]".to_string()], "imported:1", Some("linux/arm64"))
        .await
        .unwrap();

    let record = driver.image_record("imported:1").unwrap();
    assert_eq!(record.paths, vec!["/bin/hello"]);
    assert_eq!(record.platform.as_deref(), Some("linux/arm64"));

    let mut saved = Vec::new();
    driver.save_image(&image, &mut saved).await.unwrap();
    let mut entries: Vec<String> = tar::Archive::new(saved.as_slice())
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().display().to_string())
        .collect();
    entries.sort();
    assert_eq!(entries, vec!["layer.tar", "manifest.json"]);
}

#[tokio::test]
async fn test_import_missing_archive_is_io() {
    let driver = MockDriver::new();
    let err = driver
        .import(std::path::Path::new("/nonexistent/rootfs.tar"), &[], "x:1", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[tokio::test]
async fn test_delete_image_in_use() {
    let driver = driver_with_base().await;
    let container = driver
        .start_container(&ContainerConfig::new("base:1.0"))
        .await
        .unwrap();
    let image = driver.commit(&container, "", &[], "").await.unwrap();

    let err = driver
        .delete_image(&ImageId::new("base:1.0"))
        .await
        .unwrap_err();
    assert!(matches!(err, KilnError::ImageInUse { .. }));

    driver.delete_image(&image).await.unwrap();
    let err = driver.sha256(&image).await.unwrap_err();
    assert!(matches!(err, KilnError::ImageNotFound { .. }));
}

#[tokio::test]
async fn test_pull_unknown_image() {
    let driver = MockDriver::new();
    let err = driver.pull("ghcr.io/org/nope:1", None).await.unwrap_err();
    assert!(matches!(err, KilnError::ImageNotFound { .. }));
}

#[tokio::test]
async fn test_shared_across_tasks() {
    let driver: Arc<dyn Driver> = Arc::new(driver_with_base().await);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let driver = Arc::clone(&driver);
            tokio::spawn(async move {
                let id = driver
                    .start_container(&ContainerConfig::new("base:1.0"))
                    .await?;
                driver.commit(&id, "", &[], "").await?;
                driver.stop_container(&id).await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    driver.verify().await.unwrap();
}
