use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{AuthIdentity, NewRideRequest, RequestId},
    protocol::FeedSnapshot,
};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::info;

pub mod config;
pub mod error;
pub mod feed;
pub mod publisher;
pub mod session;
pub mod transport;
pub mod view;

pub use config::{load_client_settings, ClientSettings};
pub use error::{AuthError, PublishError, SubscriptionError};
pub use feed::{materialize, FeedOrdering, FeedSubscriber, FeedView, SubscriberSettings};
pub use publisher::{RequestPublisher, RideRequestForm};
pub use session::{Credentials, Session, SessionGate};
pub use view::{project, ride_request_line, ViewState};

/// External authentication service. The core only consumes its state signal.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn create_user(&self, credentials: &Credentials) -> Result<()>;
    async fn sign_in(&self, credentials: &Credentials) -> Result<()>;
    async fn sign_out(&self) -> Result<()>;
    /// Current identity, updated on every confirmed sign-in or sign-out.
    fn auth_state(&self) -> watch::Receiver<Option<AuthIdentity>>;
}

/// External shared request log.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn push(&self, request: NewRideRequest) -> Result<RequestId>;
    /// Opens a full-snapshot subscription. Dropping the returned handle releases it.
    async fn subscribe(&self) -> Result<Subscription>;
}

/// Live snapshot stream from a [`RequestStore`].
pub struct Subscription {
    snapshots: mpsc::Receiver<FeedSnapshot>,
    worker: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(snapshots: mpsc::Receiver<FeedSnapshot>) -> Self {
        Self {
            snapshots,
            worker: None,
        }
    }

    pub fn with_worker(snapshots: mpsc::Receiver<FeedSnapshot>, worker: JoinHandle<()>) -> Self {
        Self {
            snapshots,
            worker: Some(worker),
        }
    }

    /// `None` once the store side has gone away.
    pub async fn next_snapshot(&mut self) -> Option<FeedSnapshot> {
        self.snapshots.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.snapshots.close();
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionChanged(Session),
    FeedUpdated { len: usize },
    SubscriptionLost,
    Error(String),
}

/// Wires the session gate, publisher and feed subscriber around one pair of collaborators.
pub struct FeedClient {
    gate: Arc<SessionGate>,
    publisher: RequestPublisher,
    feed: Arc<FeedSubscriber>,
    events: broadcast::Sender<ClientEvent>,
    auth_listener: Mutex<Option<JoinHandle<()>>>,
}

impl FeedClient {
    pub fn new(
        auth: Arc<dyn AuthProvider>,
        store: Arc<dyn RequestStore>,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let feed = FeedSubscriber::new(
            Arc::clone(&store),
            settings.subscriber_settings(),
            events.clone(),
        );
        let gate = SessionGate::new(auth, Arc::clone(&feed), events.clone());
        let publisher = RequestPublisher::new(store, events.clone());
        Arc::new(Self {
            gate,
            publisher,
            feed,
            events,
            auth_listener: Mutex::new(None),
        })
    }

    /// Starts following the auth collaborator. Calling it again is a no-op.
    pub async fn run(&self) {
        let mut listener = self.auth_listener.lock().await;
        if listener.is_none() {
            *listener = Some(self.gate.spawn_auth_listener());
        }
    }

    pub async fn shutdown(&self) {
        if let Some(listener) = self.auth_listener.lock().await.take() {
            listener.abort();
        }
        self.feed.stop();
        info!("client: shut down");
    }

    pub async fn register(&self, credentials: &Credentials) -> Result<(), AuthError> {
        self.gate.register(credentials).await
    }

    pub async fn login(&self, credentials: &Credentials) -> Result<(), AuthError> {
        self.gate.login(credentials).await
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        self.gate.logout().await
    }

    pub async fn publish(&self, form: &mut RideRequestForm) -> Result<(), PublishError> {
        let session = self.gate.session();
        self.publisher.publish(form, &session).await
    }

    pub fn session(&self) -> Session {
        self.gate.session()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<Session> {
        self.gate.subscribe_session()
    }

    pub fn feed(&self) -> FeedView {
        self.feed.feed()
    }

    pub fn is_feed_active(&self) -> bool {
        self.feed.is_active()
    }

    pub fn feed_updates(&self) -> WatchStream<FeedView> {
        WatchStream::new(self.feed.subscribe_feed())
    }

    pub fn view(&self) -> ViewState {
        project(&self.session(), &self.feed())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
