//! Registry session state.
//!
//! A driver holds at most one authenticated registry session. Login opens
//! it, logout closes it, and push/pull consult it. All state changes go
//! through [`RegistrySession::transition`], so an invalid transition is an
//! ordinary error return instead of a stuck lock.

use futures::future::BoxFuture;
use kiln_common::{KilnError, KilnResult};
use parking_lot::Mutex;

use crate::driver::Driver;
use crate::reference::{registry_host, registry_of};

/// Session state of a driver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session has been opened, or the last one was closed.
    #[default]
    Unauthenticated,
    /// A login is in flight.
    LoggingIn {
        /// Registry being logged into.
        registry: String,
    },
    /// Logged in.
    Authenticated {
        /// Registry of the session.
        registry: String,
    },
}

impl SessionState {
    /// Registry the session is bound to, if any.
    #[must_use]
    pub fn registry(&self) -> Option<&str> {
        match self {
            Self::Unauthenticated => None,
            Self::LoggingIn { registry } | Self::Authenticated { registry } => Some(registry),
        }
    }
}

/// Events that move a session between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A login for `registry` starts.
    LoginStarted {
        /// Normalized registry host.
        registry: String,
    },
    /// The in-flight login was accepted.
    LoginSucceeded,
    /// The in-flight login was rejected.
    LoginFailed,
    /// Logout of `registry`.
    LoggedOut {
        /// Normalized registry host.
        registry: String,
    },
}

/// How a registry operation relates to the open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAccess {
    /// No session is open; the operation runs anonymously.
    Anonymous,
    /// The session covers the operation's registry.
    Authenticated,
}

/// The single registry session of a driver.
#[derive(Debug, Default)]
pub struct RegistrySession {
    state: Mutex<SessionState>,
}

impl RegistrySession {
    /// Create an unauthenticated session holder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Apply `event` and return the new state.
    ///
    /// # Errors
    ///
    /// - [`KilnError::SessionActive`] when logging in while a session exists
    /// - [`KilnError::NoSession`] when logging out without a session
    /// - [`KilnError::SessionMismatch`] when logging out of another registry
    /// - [`KilnError::Internal`] for completion events without a login in flight
    pub fn transition(&self, event: SessionEvent) -> KilnResult<SessionState> {
        let mut state = self.state.lock();

        let next = match (&*state, event) {
            (SessionState::Unauthenticated, SessionEvent::LoginStarted { registry }) => {
                SessionState::LoggingIn { registry }
            }
            (
                SessionState::LoggingIn { registry } | SessionState::Authenticated { registry },
                SessionEvent::LoginStarted { .. },
            ) => {
                return Err(KilnError::SessionActive {
                    registry: registry.clone(),
                });
            }
            (SessionState::LoggingIn { registry }, SessionEvent::LoginSucceeded) => {
                SessionState::Authenticated {
                    registry: registry.clone(),
                }
            }
            (SessionState::LoggingIn { .. }, SessionEvent::LoginFailed) => {
                SessionState::Unauthenticated
            }
            (SessionState::Authenticated { registry: active }, SessionEvent::LoggedOut { registry }) => {
                if *active != registry {
                    return Err(KilnError::SessionMismatch {
                        active: active.clone(),
                        requested: registry,
                    });
                }
                SessionState::Unauthenticated
            }
            (SessionState::LoggingIn { registry: active }, SessionEvent::LoggedOut { .. }) => {
                return Err(KilnError::SessionActive {
                    registry: active.clone(),
                });
            }
            (SessionState::Unauthenticated, SessionEvent::LoggedOut { registry }) => {
                return Err(KilnError::NoSession { registry });
            }
            (current, event @ (SessionEvent::LoginSucceeded | SessionEvent::LoginFailed)) => {
                return Err(KilnError::Internal {
                    message: format!("session event {event:?} in state {current:?}"),
                });
            }
        };

        tracing::debug!(from = ?*state, to = ?next, "Registry session transition");
        *state = next.clone();
        Ok(next)
    }

    /// Begin a login for `target`.
    ///
    /// The returned guard must be finished with the login outcome; dropping
    /// it unfinished (e.g. a cancelled login) releases the session.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::SessionActive`] if a session is open or opening.
    pub fn begin_login(&self, target: &str) -> KilnResult<PendingLogin<'_>> {
        let registry = registry_host(target);
        self.transition(SessionEvent::LoginStarted {
            registry: registry.clone(),
        })?;
        Ok(PendingLogin {
            session: self,
            registry,
            finished: false,
        })
    }

    /// Close the session for `target`, returning the normalized registry.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::NoSession`] or [`KilnError::SessionMismatch`].
    pub fn logout(&self, target: &str) -> KilnResult<String> {
        let registry = registry_host(target);
        self.transition(SessionEvent::LoggedOut {
            registry: registry.clone(),
        })?;
        Ok(registry)
    }

    /// Check whether a push or pull of `image` may run under this session.
    ///
    /// Operations against a registry other than the session's fail fast
    /// instead of running with the wrong credentials.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::SessionMismatch`] for a foreign registry.
    pub fn authorize(&self, image: &str) -> KilnResult<SessionAccess> {
        let requested = registry_of(image)?;
        let state = self.state.lock();

        match state.registry() {
            None => Ok(SessionAccess::Anonymous),
            Some(active) if active == requested => Ok(SessionAccess::Authenticated),
            Some(active) => Err(KilnError::SessionMismatch {
                active: active.to_string(),
                requested,
            }),
        }
    }
}

/// A login in flight, created by [`RegistrySession::begin_login`].
#[derive(Debug)]
#[must_use = "a pending login must be finished with its outcome"]
pub struct PendingLogin<'a> {
    session: &'a RegistrySession,
    registry: String,
    finished: bool,
}

impl PendingLogin<'_> {
    /// Normalized registry host being logged into.
    #[must_use]
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Record the outcome of the login and pass it through.
    ///
    /// # Errors
    ///
    /// Returns `outcome`'s error.
    pub fn finish<T>(mut self, outcome: KilnResult<T>) -> KilnResult<T> {
        self.finished = true;
        let event = if outcome.is_ok() {
            SessionEvent::LoginSucceeded
        } else {
            SessionEvent::LoginFailed
        };
        self.session.transition(event)?;

        if outcome.is_ok() {
            tracing::info!(registry = %self.registry, "Registry session opened");
        }
        outcome
    }
}

impl Drop for PendingLogin<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(registry = %self.registry, "Login abandoned, releasing session");
            if let Err(err) = self.session.transition(SessionEvent::LoginFailed) {
                tracing::warn!(error = %err, "Failed to release abandoned login");
            }
        }
    }
}

/// Run `f` inside a registry session, logging out on every exit path.
///
/// The first error wins: a failure of `f` is returned even if the logout
/// also fails (the logout failure is logged).
///
/// # Errors
///
/// Returns the login error, the error of `f`, or the logout error.
pub async fn with_login<'a, D, T, F>(
    driver: &'a D,
    repo: &'a str,
    username: &str,
    password: &str,
    f: F,
) -> KilnResult<T>
where
    D: Driver + ?Sized,
    F: FnOnce(&'a D) -> BoxFuture<'a, KilnResult<T>>,
{
    driver.login(repo, username, password).await?;

    let result = f(driver).await;
    let logout = driver.logout(repo).await;

    match (result, logout) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(logout_err)) => {
            tracing::warn!(repo, error = %logout_err, "Logout failed after session error");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_then_logout() {
        let session = RegistrySession::new();
        let pending = session.begin_login("https://ghcr.io").unwrap();
        assert_eq!(pending.registry(), "ghcr.io");
        assert_eq!(
            session.state(),
            SessionState::LoggingIn {
                registry: "ghcr.io".to_string()
            }
        );

        pending.finish(Ok(())).unwrap();
        assert_eq!(session.state().registry(), Some("ghcr.io"));

        session.logout("ghcr.io").unwrap();
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn double_login_fails() {
        let session = RegistrySession::new();
        session.begin_login("ghcr.io").unwrap().finish(Ok(())).unwrap();

        let err = session.begin_login("quay.io").unwrap_err();
        assert!(matches!(err, KilnError::SessionActive { registry } if registry == "ghcr.io"));
    }

    #[test]
    fn login_while_logging_in_fails() {
        let session = RegistrySession::new();
        let _pending = session.begin_login("ghcr.io").unwrap();
        assert!(session.begin_login("ghcr.io").is_err());
    }

    #[test]
    fn abandoned_login_releases_session() {
        let session = RegistrySession::new();
        drop(session.begin_login("ghcr.io").unwrap());
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[test]
    fn failed_login_releases_session() {
        let session = RegistrySession::new();
        let pending = session.begin_login("ghcr.io").unwrap();

        let outcome: KilnResult<()> = Err(KilnError::Auth {
            registry: "ghcr.io".to_string(),
            message: "denied".to_string(),
        });
        assert!(pending.finish(outcome).is_err());
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert!(session.begin_login("ghcr.io").is_ok());
    }

    #[test]
    fn logout_without_login_fails() {
        let session = RegistrySession::new();
        let err = session.logout("ghcr.io").unwrap_err();
        assert!(matches!(err, KilnError::NoSession { .. }));
    }

    #[test]
    fn logout_of_other_registry_fails() {
        let session = RegistrySession::new();
        session.begin_login("ghcr.io").unwrap().finish(Ok(())).unwrap();

        let err = session.logout("quay.io").unwrap_err();
        assert!(matches!(err, KilnError::SessionMismatch { .. }));
        assert_eq!(session.state().registry(), Some("ghcr.io"));
    }

    #[test]
    fn completion_without_login_is_internal() {
        let session = RegistrySession::new();
        let err = session.transition(SessionEvent::LoginSucceeded).unwrap_err();
        assert!(matches!(err, KilnError::Internal { .. }));
    }

    #[test]
    fn authorize_scopes_to_registry() {
        let session = RegistrySession::new();
        assert_eq!(
            session.authorize("myrepo:1.0").unwrap(),
            SessionAccess::Anonymous
        );

        session.begin_login("").unwrap().finish(Ok(())).unwrap();
        assert_eq!(
            session.authorize("myrepo:1.0").unwrap(),
            SessionAccess::Authenticated
        );

        let err = session.authorize("ghcr.io/org/app:1").unwrap_err();
        assert!(matches!(
            err,
            KilnError::SessionMismatch { active, requested }
                if active == "docker.io" && requested == "ghcr.io"
        ));
    }
}
