//! # kiln-common
//!
//! Shared types for the Kiln build driver.
//!
//! This crate provides the vocabulary every driver implementation speaks:
//! - Container and image identifiers
//! - Content and repository digests
//! - The opaque, ordered runtime version
//! - The driver error taxonomy

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod version;

pub use error::{ErrorKind, KilnError, KilnResult};
pub use id::{ContainerId, Digest, ImageId, RepoDigest};
pub use version::RuntimeVersion;
