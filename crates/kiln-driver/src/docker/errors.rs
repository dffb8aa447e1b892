//! Mapping runtime CLI failures onto the driver error taxonomy.

use kiln_common::KilnError;

use crate::reference::registry_of;

const UNAVAILABLE: &[&str] = &[
    "cannot connect to the docker daemon",
    "is the docker daemon running",
    "error during connect",
    "connection refused",
    "cannot connect to podman",
];

const AUTH: &[&str] = &[
    "unauthorized",
    "authentication required",
    "incorrect username or password",
    "denied: requested access",
    "pull access denied",
    "access to the resource is denied",
];

const CONTAINER_MISSING: &[&str] = &["no such container"];

const IMAGE_MISSING: &[&str] = &[
    "no such image",
    "manifest unknown",
    "not found: manifest",
    "repository does not exist",
    "image not known",
    "reference does not exist",
    "an image does not exist locally",
];

const IN_USE: &[&str] = &[
    "is being used by",
    "image is in use",
    "image is referenced in multiple repositories",
    "unable to delete",
];

/// What a failed command was operating on.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// A container ID.
    Container(&'a str),
    /// A local image ID or reference.
    Image(&'a str),
    /// A registry-qualified image reference.
    Remote(&'a str),
    /// A login target.
    Registry(&'a str),
    /// Nothing in particular.
    Runtime,
}

/// Turn a non-zero exit of `command` into a typed error.
pub fn classify(command: &str, target: Target<'_>, status: Option<i32>, stderr: &str) -> KilnError {
    let lowered = stderr.to_ascii_lowercase();
    let message = stderr.trim().to_string();
    let matches = |needles: &[&str]| needles.iter().any(|needle| lowered.contains(needle));

    if matches(UNAVAILABLE) {
        return KilnError::RuntimeUnavailable { message };
    }

    // Auth before not-found: "pull access denied ... repository does not exist" is both.
    if matches(AUTH) {
        let registry = match target {
            Target::Remote(image) => registry_of(image).unwrap_or_else(|_| image.to_string()),
            Target::Registry(target) => crate::reference::registry_host(target),
            _ => String::new(),
        };
        return KilnError::Auth { registry, message };
    }

    match target {
        Target::Container(id) if matches(CONTAINER_MISSING) => {
            return KilnError::ContainerNotFound { id: id.to_string() };
        }
        Target::Container(id) if lowered.contains("is not running") => {
            return KilnError::ContainerNotRunning { id: id.to_string() };
        }
        Target::Image(reference) if matches(IN_USE) || lowered.contains("conflict") => {
            return KilnError::ImageInUse {
                reference: reference.to_string(),
                message,
            };
        }
        Target::Image(reference) | Target::Remote(reference) if matches(IMAGE_MISSING) => {
            return KilnError::ImageNotFound {
                reference: reference.to_string(),
            };
        }
        _ => {}
    }

    KilnError::Runtime {
        command: command.to_string(),
        status,
        stderr: message,
    }
}
