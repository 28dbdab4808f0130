use std::{
    collections::HashSet,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use shared::{domain::RideRequest, protocol::FeedSnapshot};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{error::SubscriptionError, ClientEvent, RequestStore, Subscription};

/// Local ordered reconstruction of the request log.
pub type FeedView = Vec<RideRequest>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOrdering {
    /// Whatever order the store delivers entries in.
    #[default]
    StoreOrder,
    /// Stable sort by the store-assigned timestamp.
    CreatedAt,
}

impl FromStr for FeedOrdering {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "store" | "store_order" => Ok(Self::StoreOrder),
            "created_at" | "chronological" => Ok(Self::CreatedAt),
            other => Err(format!("unknown feed ordering: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberSettings {
    pub retry_attempts: usize,
    pub retry_delay: Duration,
    pub ordering: FeedOrdering,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
            ordering: FeedOrdering::StoreOrder,
        }
    }
}

/// Projects a snapshot into a view, keeping the store's entry order.
///
/// Keys are unique in the result: if the store ever repeats a key, the first
/// occurrence is kept.
pub fn materialize(snapshot: FeedSnapshot, ordering: FeedOrdering) -> FeedView {
    let mut seen = HashSet::with_capacity(snapshot.entries.len());
    let mut view: FeedView = Vec::with_capacity(snapshot.entries.len());
    for entry in snapshot.entries {
        if !seen.insert(entry.id.clone()) {
            warn!(request_id = %entry.id, "feed: duplicate key in snapshot; keeping first");
            continue;
        }
        view.push(entry.into_ride_request());
    }
    if ordering == FeedOrdering::CreatedAt {
        view.sort_by_key(|request| request.created_at);
    }
    view
}

enum Phase {
    Inactive,
    Opening { generation: u64 },
    Active { generation: u64, pump: JoinHandle<()> },
}

impl Phase {
    fn generation(&self) -> Option<u64> {
        match self {
            Phase::Inactive => None,
            Phase::Opening { generation } | Phase::Active { generation, .. } => Some(*generation),
        }
    }
}

struct SubscriberState {
    phase: Phase,
    next_generation: u64,
}

/// Owns the feed view and the single store subscription behind it.
///
/// Every opened subscription gets a fresh generation. A snapshot is applied
/// only if, under the state lock, the phase still carries that generation;
/// `stop` clears the phase under the same lock, so nothing lands afterwards.
pub struct FeedSubscriber {
    store: Arc<dyn RequestStore>,
    settings: SubscriberSettings,
    state: Mutex<SubscriberState>,
    feed: watch::Sender<FeedView>,
    events: broadcast::Sender<ClientEvent>,
}

impl FeedSubscriber {
    pub fn new(
        store: Arc<dyn RequestStore>,
        settings: SubscriberSettings,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        let (feed, _) = watch::channel(FeedView::new());
        Arc::new(Self {
            store,
            settings,
            state: Mutex::new(SubscriberState {
                phase: Phase::Inactive,
                next_generation: 0,
            }),
            feed,
            events,
        })
    }

    fn state(&self) -> MutexGuard<'_, SubscriberState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn feed(&self) -> FeedView {
        self.feed.borrow().clone()
    }

    pub fn subscribe_feed(&self) -> watch::Receiver<FeedView> {
        self.feed.subscribe()
    }

    /// True while a subscription is open or being opened.
    pub fn is_active(&self) -> bool {
        self.state().phase.generation().is_some()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), SubscriptionError> {
        let generation = {
            let mut state = self.state();
            if state.phase.generation().is_some() {
                debug!("feed: start ignored; subscription already active");
                return Ok(());
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            state.phase = Phase::Opening { generation };
            // A new subscription never shows the previous session's requests.
            self.feed.send_replace(FeedView::new());
            generation
        };

        // Failure or cancellation of this future must not leave the phase in `Opening`.
        let _opening = OpeningGuard {
            subscriber: self,
            generation,
        };

        let subscription = match self.open_with_retry(generation).await? {
            Some(subscription) => subscription,
            None => return Ok(()),
        };

        let mut state = self.state();
        if state.phase.generation() != Some(generation) {
            drop(state);
            info!(generation, "feed: stopped while opening; releasing subscription");
            drop(subscription);
            return Ok(());
        }
        let pump = tokio::spawn(run_pump(Arc::downgrade(self), generation, subscription));
        state.phase = Phase::Active { generation, pump };
        drop(state);
        info!(generation, "feed: subscription active");
        Ok(())
    }

    /// Releases the subscription. Idempotent.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut self.state().phase, Phase::Inactive);
        match previous {
            Phase::Inactive => debug!("feed: stop ignored; no active subscription"),
            Phase::Opening { generation } => {
                info!(generation, "feed: subscription cancelled while opening");
            }
            Phase::Active { generation, pump } => {
                pump.abort();
                info!(generation, "feed: subscription released");
            }
        }
    }

    /// `Ok(None)` means the attempt was abandoned because `stop` ran meanwhile.
    async fn open_with_retry(
        &self,
        generation: u64,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            if self.state().phase.generation() != Some(generation) {
                return Ok(None);
            }
            match self.store.subscribe().await {
                Ok(subscription) => return Ok(Some(subscription)),
                Err(err) => {
                    last_error = format!("{err:#}");
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %last_error,
                        "feed: subscribe attempt failed"
                    );
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        error!(attempts, error = %last_error, "feed: store unreachable; giving up");
        Err(SubscriptionError::Unreachable {
            attempts,
            message: last_error,
        })
    }

    /// Returns false when the snapshot was discarded because its subscription was released.
    fn apply_snapshot(&self, generation: u64, snapshot: FeedSnapshot) -> bool {
        let state = self.state();
        if state.phase.generation() != Some(generation) {
            debug!(generation, "feed: discarding snapshot from released subscription");
            return false;
        }
        let view = materialize(snapshot, self.settings.ordering);
        let len = view.len();
        self.feed.send_replace(view);
        drop(state);

        debug!(generation, len, "feed: snapshot applied");
        let _ = self.events.send(ClientEvent::FeedUpdated { len });
        true
    }

    fn handle_stream_end(&self, generation: u64) {
        let mut state = self.state();
        if state.phase.generation() != Some(generation) {
            return;
        }
        state.phase = Phase::Inactive;
        drop(state);

        warn!(generation, "feed: store closed the subscription");
        let _ = self.events.send(ClientEvent::SubscriptionLost);
    }
}

/// Returns the phase to `Inactive` if `start` ends before reaching `Active`.
struct OpeningGuard<'a> {
    subscriber: &'a FeedSubscriber,
    generation: u64,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.subscriber.state();
        if matches!(state.phase, Phase::Opening { generation } if generation == self.generation) {
            state.phase = Phase::Inactive;
            debug!(generation = self.generation, "feed: open attempt abandoned");
        }
    }
}

async fn run_pump(subscriber: Weak<FeedSubscriber>, generation: u64, mut subscription: Subscription) {
    while let Some(snapshot) = subscription.next_snapshot().await {
        let Some(subscriber) = subscriber.upgrade() else {
            return;
        };
        if !subscriber.apply_snapshot(generation, snapshot) {
            return;
        }
    }
    if let Some(subscriber) = subscriber.upgrade() {
        subscriber.handle_stream_end(generation);
    }
}

#[cfg(test)]
#[path = "tests/feed_tests.rs"]
mod tests;
