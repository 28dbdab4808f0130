use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{AuthIdentity, NewRideRequest, RequestId, RideRequest},
    error::{ApiError, ApiException},
    protocol::{AuthGrant, CredentialsRequest, PublishRideRequest, ServerEvent, FEED_PATH},
};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{session::Credentials, AuthProvider, RequestStore, Subscription};

const SNAPSHOT_BUFFER: usize = 16;

/// Auth collaborator backed by the server's `/auth/*` routes.
///
/// Sign-out is local: the bearer token is dropped and the signed-out state is published.
pub struct HttpAuthProvider {
    http: Client,
    server_url: String,
    token: RwLock<Option<String>>,
    state: watch::Sender<Option<AuthIdentity>>,
}

impl HttpAuthProvider {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(None);
        Arc::new(Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            state,
        })
    }

    pub async fn bearer_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub fn current_identity(&self) -> Option<AuthIdentity> {
        self.state.borrow().clone()
    }

    async fn exchange_credentials(&self, route: &str, credentials: &Credentials) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{route}", self.server_url))
            .json(&CredentialsRequest {
                email: credentials.email.clone(),
                password: credentials.password.clone(),
            })
            .send()
            .await
            .with_context(|| format!("failed to reach auth service at {}", self.server_url))?;
        let grant: AuthGrant = read_json(response).await?;

        *self.token.write().await = Some(grant.token);
        info!(user_id = grant.user_id.0, "auth: signed in");
        self.state.send_replace(Some(AuthIdentity {
            user_id: grant.user_id,
            email: grant.email,
        }));
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn create_user(&self, credentials: &Credentials) -> Result<()> {
        self.exchange_credentials("/auth/register", credentials).await
    }

    async fn sign_in(&self, credentials: &Credentials) -> Result<()> {
        self.exchange_credentials("/auth/login", credentials).await
    }

    async fn sign_out(&self) -> Result<()> {
        self.token.write().await.take();
        self.state.send_replace(None);
        info!("auth: signed out");
        Ok(())
    }

    fn auth_state(&self) -> watch::Receiver<Option<AuthIdentity>> {
        self.state.subscribe()
    }
}

/// Store collaborator: HTTP for appends, a websocket for snapshots.
pub struct HttpRequestStore {
    http: Client,
    server_url: String,
    auth: Arc<HttpAuthProvider>,
}

impl HttpRequestStore {
    pub fn new(server_url: impl Into<String>, auth: Arc<HttpAuthProvider>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    async fn token(&self) -> Result<String> {
        self.auth
            .bearer_token()
            .await
            .ok_or_else(|| anyhow!("not signed in: missing bearer token"))
    }
}

#[async_trait]
impl RequestStore for HttpRequestStore {
    async fn push(&self, request: NewRideRequest) -> Result<RequestId> {
        let token = self.token().await?;
        if let Some(identity) = self.auth.current_identity() {
            if identity.user_id != request.author {
                return Err(anyhow!(
                    "request author {} does not match signed-in user {}",
                    request.author,
                    identity.user_id
                ));
            }
        }

        let response = self
            .http
            .post(format!("{}/{FEED_PATH}", self.server_url))
            .bearer_auth(token)
            .json(&PublishRideRequest {
                pickup_location: request.pickup_location,
                dropoff_location: request.dropoff_location,
            })
            .send()
            .await
            .context("failed to reach feed store")?;
        let stored: RideRequest = read_json(response).await?;
        Ok(stored.id)
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let token = self.token().await?;
        let url = ws_url(&self.server_url, &token)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect feed websocket at {}", self.server_url))?;
        let (_, mut ws_reader) = ws_stream.split();

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        let worker = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::FeedSnapshot { snapshot }) => {
                            if tx.send(snapshot).await.is_err() {
                                debug!("feed: snapshot receiver dropped");
                                break;
                            }
                        }
                        Ok(ServerEvent::Error(err)) => {
                            warn!(code = ?err.code, message = %err.message, "feed: store reported error");
                        }
                        Err(err) => warn!(%err, "feed: invalid server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "feed: websocket receive failed");
                        break;
                    }
                }
            }
        });

        Ok(Subscription::with_worker(rx, worker))
    }
}

pub(crate) fn ws_url(server_url: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("invalid server_url: {server_url}"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return Err(anyhow!("server_url must start with http:// or https://")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot convert {server_url} to a websocket url"))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

/// Decodes a success body. Error bodies in `ApiError` shape become [`ApiException`]s.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.context("malformed response body");
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&body) {
        Ok(api_error) => Err(ApiException::from(api_error).into()),
        Err(_) => Err(anyhow!("unexpected status {status}: {body}")),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
