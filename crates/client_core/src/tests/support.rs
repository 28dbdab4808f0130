use std::{
    collections::HashMap,
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{AuthIdentity, NewRideRequest, RequestId, RideRequest, UserId},
    error::{ApiException, ErrorCode},
    protocol::{FeedSnapshot, SnapshotEntry},
};
use tokio::sync::{mpsc, watch};

use crate::{session::Credentials, AuthProvider, RequestStore, Subscription};

pub(crate) fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub(crate) fn ride_request(id: &str, author: i64, pickup: &str, dropoff: &str) -> RideRequest {
    ride_request_at(id, author, pickup, dropoff, base_time())
}

pub(crate) fn ride_request_at(
    id: &str,
    author: i64,
    pickup: &str,
    dropoff: &str,
    created_at: DateTime<Utc>,
) -> RideRequest {
    RideRequest {
        id: RequestId::from(id),
        author: UserId(author),
        author_label: format!("user{author}@example.com"),
        pickup_location: pickup.to_string(),
        dropoff_location: dropoff.to_string(),
        created_at,
    }
}

pub(crate) fn snapshot_of(requests: &[RideRequest]) -> FeedSnapshot {
    FeedSnapshot::new(requests.iter().cloned().map(SnapshotEntry::from).collect())
}

pub(crate) fn identity(user_id: i64, email: &str) -> AuthIdentity {
    AuthIdentity {
        user_id: UserId(user_id),
        email: email.to_string(),
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub(crate) async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub(crate) async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("timed out")
}

/// In-memory auth collaborator. Accounts are keyed by email; ids count up from `first_id`.
pub(crate) struct FakeAuth {
    state: watch::Sender<Option<AuthIdentity>>,
    accounts: Mutex<HashMap<String, (String, UserId)>>,
    first_id: i64,
    offline: AtomicBool,
    pub(crate) sign_out_calls: AtomicUsize,
}

impl FakeAuth {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_first_id(1)
    }

    pub(crate) fn with_first_id(first_id: i64) -> Arc<Self> {
        let (state, _) = watch::channel(None);
        Arc::new(Self {
            state,
            accounts: Mutex::new(HashMap::new()),
            first_id,
            offline: AtomicBool::new(false),
            sign_out_calls: AtomicUsize::new(0),
        })
    }

    /// Publishes an identity change as if it came from elsewhere.
    pub(crate) fn emit(&self, identity: Option<AuthIdentity>) {
        self.state.send_replace(identity);
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for FakeAuth {
    async fn create_user(&self, credentials: &Credentials) -> Result<()> {
        self.check_online()?;
        let signed_in = {
            let mut accounts = self.accounts.lock().unwrap();
            if accounts.contains_key(&credentials.email) {
                return Err(ApiException::new(ErrorCode::Conflict, "email already registered").into());
            }
            let user_id = UserId(self.first_id + accounts.len() as i64);
            accounts.insert(
                credentials.email.clone(),
                (credentials.password.clone(), user_id),
            );
            identity(user_id.0, &credentials.email)
        };
        self.state.send_replace(Some(signed_in));
        Ok(())
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<()> {
        self.check_online()?;
        let user_id = {
            let accounts = self.accounts.lock().unwrap();
            match accounts.get(&credentials.email) {
                Some((password, user_id)) if *password == credentials.password => *user_id,
                _ => {
                    return Err(
                        ApiException::new(ErrorCode::Unauthorized, "invalid email or password").into(),
                    )
                }
            }
        };
        self.state
            .send_replace(Some(identity(user_id.0, &credentials.email)));
        Ok(())
    }

    async fn sign_out(&self) -> Result<()> {
        self.check_online()?;
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(None);
        Ok(())
    }

    fn auth_state(&self) -> watch::Receiver<Option<AuthIdentity>> {
        self.state.subscribe()
    }
}

/// In-memory request log. Every append is fanned out as a full snapshot to
/// each open subscription, in append order.
pub(crate) struct FakeStore {
    log: Mutex<Vec<RideRequest>>,
    subscribers: Mutex<Vec<mpsc::Sender<FeedSnapshot>>>,
    labels: Mutex<HashMap<UserId, String>>,
    failing_subscribes: AtomicUsize,
    fail_push: AtomicBool,
    push_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
}

impl FakeStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            labels: Mutex::new(HashMap::new()),
            failing_subscribes: AtomicUsize::new(0),
            fail_push: AtomicBool::new(false),
            push_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_label(self: Arc<Self>, user_id: i64, label: &str) -> Arc<Self> {
        self.labels
            .lock()
            .unwrap()
            .insert(UserId(user_id), label.to_string());
        self
    }

    /// The next `count` subscribe calls fail.
    pub(crate) fn fail_subscribes(&self, count: usize) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_push(&self, fail: bool) {
        self.fail_push.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn pushes(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribes(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn entries(&self) -> Vec<RideRequest> {
        self.log.lock().unwrap().clone()
    }

    /// Subscriptions whose receiving side is still held.
    pub(crate) fn open_subscriptions(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    /// Sends an arbitrary snapshot to every open subscription.
    pub(crate) fn deliver(&self, snapshot: FeedSnapshot) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.try_send(snapshot.clone()).is_ok());
    }

    /// Ends every open subscription from the store side.
    pub(crate) fn close_all(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    fn broadcast_log(&self) {
        let snapshot = snapshot_of(&self.log.lock().unwrap());
        self.deliver(snapshot);
    }
}

#[async_trait]
impl RequestStore for FakeStore {
    async fn push(&self, request: NewRideRequest) -> Result<RequestId> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(anyhow!("store offline"));
        }
        let stored = {
            let mut log = self.log.lock().unwrap();
            let seq = log.len() + 1;
            let author_label = self
                .labels
                .lock()
                .unwrap()
                .get(&request.author)
                .cloned()
                .unwrap_or_else(|| format!("user{}@example.com", request.author.0));
            let stored = RideRequest {
                id: RequestId(format!("r{seq}")),
                author: request.author,
                author_label,
                pickup_location: request.pickup_location,
                dropoff_location: request.dropoff_location,
                created_at: base_time() + chrono::Duration::seconds(seq as i64),
            };
            log.push(stored.clone());
            stored
        };
        self.broadcast_log();
        Ok(stored.id)
    }

    async fn subscribe(&self) -> Result<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_subscribes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_subscribes.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("store unreachable"));
        }
        let (tx, rx) = mpsc::channel(16);
        let mut subscribers = self.subscribers.lock().unwrap();
        let _ = tx.try_send(snapshot_of(&self.log.lock().unwrap()));
        subscribers.push(tx);
        Ok(Subscription::new(rx))
    }
}
