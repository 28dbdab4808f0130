use server_api::ApiContext;
use tokio::sync::broadcast;

/// Notification that the request log grew. Subscribers re-read the whole log.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FeedChanged;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) feed_changed: broadcast::Sender<FeedChanged>,
}

impl AppState {
    pub(crate) fn new(api: ApiContext) -> Self {
        let (feed_changed, _) = broadcast::channel(256);
        Self { api, feed_changed }
    }
}
