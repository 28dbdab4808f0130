use shared::error::ApiException;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("credentials rejected: {0}")]
    Rejected(String),
    #[error("auth service unavailable: {0}")]
    Transport(String),
}

impl AuthError {
    /// Server-side refusals arrive as [`ApiException`]; anything else is a transport failure.
    pub fn from_collaborator(err: &anyhow::Error) -> Self {
        match err.downcast_ref::<ApiException>() {
            Some(api) => Self::Rejected(api.message.clone()),
            None => Self::Transport(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("publish attempted without an authenticated session")]
    NotAuthenticated,
    #[error("{field} must not be empty")]
    InvalidInput { field: &'static str },
    #[error("store rejected ride request: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("feed store unreachable after {attempts} attempt(s): {message}")]
    Unreachable { attempts: usize, message: String },
}
