use std::sync::Arc;

use shared::domain::NewRideRequest;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{error::PublishError, session::Session, ClientEvent, RequestStore};

/// Pending input for a new ride request. Cleared once a publish succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RideRequestForm {
    pub pickup_location: String,
    pub dropoff_location: String,
}

impl RideRequestForm {
    pub fn new(pickup_location: impl Into<String>, dropoff_location: impl Into<String>) -> Self {
        Self {
            pickup_location: pickup_location.into(),
            dropoff_location: dropoff_location.into(),
        }
    }

    pub fn clear(&mut self) {
        self.pickup_location.clear();
        self.dropoff_location.clear();
    }
}

pub struct RequestPublisher {
    store: Arc<dyn RequestStore>,
    events: broadcast::Sender<ClientEvent>,
}

impl RequestPublisher {
    pub fn new(store: Arc<dyn RequestStore>, events: broadcast::Sender<ClientEvent>) -> Self {
        Self { store, events }
    }

    /// Appends a request to the shared log. Preconditions are checked before
    /// the store is contacted; failures are reported once and never retried.
    pub async fn publish(
        &self,
        form: &mut RideRequestForm,
        session: &Session,
    ) -> Result<(), PublishError> {
        let request = validate(form, session)?;
        let author = request.author;

        match self.store.push(request).await {
            Ok(request_id) => {
                info!(request_id = %request_id, author = author.0, "publish: ride request stored");
                form.clear();
                Ok(())
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(author = author.0, error = %message, "publish: store rejected ride request");
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("publish failed: {message}")));
                Err(PublishError::Store(message))
            }
        }
    }
}

fn validate(form: &RideRequestForm, session: &Session) -> Result<NewRideRequest, PublishError> {
    let Some(author) = session.identity else {
        error!("publish: attempted without an authenticated session");
        return Err(PublishError::NotAuthenticated);
    };

    let pickup_location = form.pickup_location.trim();
    if pickup_location.is_empty() {
        debug!("publish: pickup location missing");
        return Err(PublishError::InvalidInput {
            field: "pickup_location",
        });
    }
    let dropoff_location = form.dropoff_location.trim();
    if dropoff_location.is_empty() {
        debug!("publish: dropoff location missing");
        return Err(PublishError::InvalidInput {
            field: "dropoff_location",
        });
    }

    Ok(NewRideRequest {
        author,
        pickup_location: pickup_location.to_string(),
        dropoff_location: dropoff_location.to_string(),
    })
}

#[cfg(test)]
#[path = "tests/publisher_tests.rs"]
mod tests;
