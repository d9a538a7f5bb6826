//! Who is signed in.
//!
//! The session is an explicit context object: created when the host signs
//! a user in, cleared on sign-out, and handed to whoever needs it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl CurrentUser {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            display_name: None,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name shown next to this user's messages: the local part of the
    /// email, else the display name, else `Anonymous`.
    #[must_use]
    pub fn display_label(&self) -> String {
        self.email
            .as_deref()
            .and_then(|email| email.split('@').next())
            .filter(|local| !local.is_empty())
            .or_else(|| self.display_name.as_deref().filter(|name| !name.is_empty()))
            .unwrap_or("Anonymous")
            .to_string()
    }
}

/// Source of the current user and of authentication changes.
pub trait IdentityProvider: Send + Sync {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<CurrentUser>;

    /// Notified on every sign-in and sign-out.
    fn watch_user(&self) -> watch::Receiver<Option<CurrentUser>>;
}

/// Cloneable session handle. Clones share the same session.
#[derive(Debug, Clone)]
pub struct SessionContext {
    user: Arc<watch::Sender<Option<CurrentUser>>>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// A signed-out session.
    #[must_use]
    pub fn new() -> Self {
        let (user, _) = watch::channel(None);
        Self {
            user: Arc::new(user),
        }
    }

    #[must_use]
    pub fn signed_in(user: CurrentUser) -> Self {
        let session = Self::new();
        session.sign_in(user);
        session
    }

    pub fn sign_in(&self, user: CurrentUser) {
        self.user.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        self.user.send_replace(None);
    }
}

impl IdentityProvider for SessionContext {
    fn current_user(&self) -> Option<CurrentUser> {
        self.user.borrow().clone()
    }

    fn watch_user(&self) -> watch::Receiver<Option<CurrentUser>> {
        self.user.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_label_fallbacks() {
        let user = CurrentUser::new("u-1")
            .with_email("alice@example.com")
            .with_display_name("Alice Liddell");
        assert_eq!(user.display_label(), "alice");

        let user = CurrentUser::new("u-1").with_display_name("Alice Liddell");
        assert_eq!(user.display_label(), "Alice Liddell");

        let user = CurrentUser::new("u-1").with_email("@example.com");
        assert_eq!(user.display_label(), "Anonymous");
    }

    #[test]
    fn test_session_sign_in_and_out() {
        let session = SessionContext::new();
        let mut watcher = session.watch_user();
        assert!(session.current_user().is_none());

        session.sign_in(CurrentUser::new("u-1"));
        assert!(watcher.has_changed().unwrap());
        assert_eq!(watcher.borrow_and_update().as_ref().map(|u| u.id.as_str()), Some("u-1"));

        // Clones share state.
        session.clone().sign_out();
        assert!(session.current_user().is_none());
    }
}
