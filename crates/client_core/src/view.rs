use shared::domain::RideRequest;

use crate::{feed::FeedView, session::Session};

/// The two mutually exclusive screens a front-end can show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewState {
    Anonymous,
    Authenticated {
        display_label: String,
        requests: FeedView,
    },
}

pub fn project(session: &Session, feed: &FeedView) -> ViewState {
    if session.is_authenticated() {
        ViewState::Authenticated {
            display_label: session.display_label.clone(),
            requests: feed.clone(),
        }
    } else {
        ViewState::Anonymous
    }
}

pub fn ride_request_line(request: &RideRequest) -> String {
    format!(
        "From {}: Pickup Location - {}, Dropoff Location - {}",
        request.author_label, request.pickup_location, request.dropoff_location
    )
}
