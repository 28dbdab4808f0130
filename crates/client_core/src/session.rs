use std::{fmt, sync::Arc};

use shared::domain::{AuthIdentity, UserId};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use zeroize::Zeroize;

use crate::{error::AuthError, feed::FeedSubscriber, AuthProvider, ClientEvent};

/// The signed-in identity, or its absence. Replaced wholesale on every auth signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub identity: Option<UserId>,
    pub display_label: String,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(identity: &AuthIdentity) -> Self {
        Self {
            identity: Some(identity.user_id),
            display_label: identity.email.clone(),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }
}

impl From<Option<&AuthIdentity>> for Session {
    fn from(value: Option<&AuthIdentity>) -> Self {
        value.map(Self::authenticated).unwrap_or_default()
    }
}

/// Email/password pair handed to the auth collaborator. The password is wiped on drop.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

/// Tracks the confirmed identity and drives the feed subscription from it.
///
/// Local session state only ever changes in [`SessionGate::on_auth_state_changed`];
/// register, login and logout merely ask the collaborator and wait for its signal.
pub struct SessionGate {
    auth: Arc<dyn AuthProvider>,
    feed: Arc<FeedSubscriber>,
    session: watch::Sender<Session>,
    events: broadcast::Sender<ClientEvent>,
}

impl SessionGate {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        feed: Arc<FeedSubscriber>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let (session, _) = watch::channel(Session::anonymous());
        Arc::new(Self {
            auth,
            feed,
            session,
            events,
        })
    }

    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<Session> {
        self.session.subscribe()
    }

    pub async fn on_auth_state_changed(&self, identity: Option<AuthIdentity>) {
        let next = Session::from(identity.as_ref());
        let previous = self.session.borrow().identity;

        let Some(user_id) = next.identity else {
            // Release before publishing the signed-out session.
            self.feed.stop();
            if previous.is_some() {
                info!("session: signed out");
            }
            self.session.send_replace(next.clone());
            let _ = self.events.send(ClientEvent::SessionChanged(next));
            return;
        };

        if previous.is_some_and(|prev| prev != user_id) {
            info!(
                previous = ?previous,
                user_id = user_id.0,
                "session: identity switched; releasing prior subscription"
            );
            self.feed.stop();
        }
        self.session.send_replace(next.clone());
        info!(user_id = user_id.0, "session: authenticated");
        let _ = self.events.send(ClientEvent::SessionChanged(next));

        if let Err(err) = self.feed.start().await {
            error!(%err, user_id = user_id.0, "session: feed subscription failed");
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }
    }

    /// Follows the collaborator's state signal, starting with its current value.
    pub fn spawn_auth_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut auth_state = self.auth.auth_state();
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let identity = auth_state.borrow_and_update().clone();
                gate.on_auth_state_changed(identity).await;
                if auth_state.changed().await.is_err() {
                    warn!("session: auth state signal closed");
                    break;
                }
            }
        })
    }

    pub async fn register(&self, credentials: &Credentials) -> Result<(), AuthError> {
        self.auth
            .create_user(credentials)
            .await
            .map_err(|err| self.report_auth_failure("register", &err))
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<(), AuthError> {
        self.auth
            .sign_in(credentials)
            .await
            .map_err(|err| self.report_auth_failure("login", &err))
    }

    /// Asks the collaborator to sign out. The subscription stops only once
    /// the resulting signed-out signal arrives.
    pub async fn logout(&self) -> Result<(), AuthError> {
        self.auth
            .sign_out()
            .await
            .map_err(|err| self.report_auth_failure("logout", &err))
    }

    fn report_auth_failure(&self, operation: &'static str, err: &anyhow::Error) -> AuthError {
        let auth_error = AuthError::from_collaborator(err);
        warn!(operation, error = %auth_error, "session: auth request failed");
        let _ = self
            .events
            .send(ClientEvent::Error(format!("{operation} failed: {auth_error}")));
        auth_error
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
