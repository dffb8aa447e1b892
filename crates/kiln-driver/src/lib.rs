//! # kiln-driver
//!
//! Container runtime driver for image build pipelines.
//!
//! A build pipeline starts a container from a base image, provisions it,
//! and turns the result into an artifact: a committed image, an exported
//! filesystem archive, or a pushed registry image. This crate provides:
//! - [`ContainerConfig`], the value describing a build container
//! - The [`Driver`] trait covering container lifecycle, image
//!   materialization, registry sessions and runtime readiness
//! - [`DockerDriver`], backed by a docker-compatible CLI
//! - [`MockDriver`], an in-memory driver for tests

#![warn(missing_docs)]

pub mod config;
pub mod container;
pub mod docker;
pub mod driver;
pub mod mock;
pub mod reference;
pub mod session;

pub use config::DriverConfig;
pub use container::ContainerConfig;
pub use docker::DockerDriver;
pub use driver::{ArchiveSink, Driver};
pub use mock::{CapturedCall, ImageRecord, MockDriver, MockOperation};
pub use reference::{ImageReference, registry_host, registry_of};
pub use session::{RegistrySession, SessionAccess, SessionState, with_login};

pub use kiln_common::{
    ContainerId, Digest, ErrorKind, ImageId, KilnError, KilnResult, RepoDigest, RuntimeVersion,
};
