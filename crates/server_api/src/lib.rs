use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::{
    domain::{AuthIdentity, RideRequest, UserId},
    error::{ApiError, ErrorCode},
    protocol::{AuthGrant, FeedSnapshot, PublishRideRequest, SnapshotEntry},
};
use storage::Storage;
use tracing::{info, warn};

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
}

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: AuthConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    email: String,
    exp: i64,
}

pub fn auth_register_route() -> &'static str {
    "/auth/register"
}

pub fn auth_login_route() -> &'static str {
    "/auth/login"
}

pub async fn register(ctx: &ApiContext, email: &str, password: &str) -> Result<AuthGrant, ApiError> {
    let email = normalize_email(email)?;
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }

    let salt = uuid::Uuid::new_v4().simple().to_string();
    let hash = hash_password(&salt, password);
    let user_id = ctx
        .storage
        .create_user(&email, &hash, &salt)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::Conflict, "email is already registered"))?;

    info!(user_id = user_id.0, "auth: account registered");
    grant(ctx, user_id, email)
}

pub async fn login(ctx: &ApiContext, email: &str, password: &str) -> Result<AuthGrant, ApiError> {
    let email = normalize_email(email)?;
    let user = ctx
        .storage
        .find_user_by_email(&email)
        .await
        .map_err(internal)?;

    let Some(user) = user else {
        warn!("auth: login for unknown account rejected");
        return Err(invalid_credentials());
    };
    if hash_password(&user.password_salt, password) != user.password_hash {
        warn!(user_id = user.user_id.0, "auth: login with wrong password rejected");
        return Err(invalid_credentials());
    }

    grant(ctx, user.user_id, user.email)
}

/// A bearer token that passed verification, with the instant it lapses.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub identity: AuthIdentity,
    pub expires_at: DateTime<Utc>,
}

impl VerifiedToken {
    /// Zero once the token has lapsed.
    pub fn time_left(&self) -> Duration {
        self.time_left_at(Utc::now())
    }

    fn time_left_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or_default()
    }
}

pub fn verify_token(ctx: &ApiContext, token: &str) -> Result<AuthIdentity, ApiError> {
    verify_session_token(ctx, token).map(|verified| verified.identity)
}

pub fn verify_session_token(ctx: &ApiContext, token: &str) -> Result<VerifiedToken, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(ctx.auth.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|err| ApiError::new(ErrorCode::Unauthorized, format!("invalid token: {err}")))?;
    let expires_at = DateTime::from_timestamp(data.claims.exp, 0)
        .ok_or_else(|| ApiError::new(ErrorCode::Unauthorized, "invalid token: bad expiry"))?;
    Ok(VerifiedToken {
        identity: AuthIdentity {
            user_id: UserId(data.claims.sub),
            email: data.claims.email,
        },
        expires_at,
    })
}

pub async fn publish_ride_request(
    ctx: &ApiContext,
    author: &AuthIdentity,
    request: PublishRideRequest,
) -> Result<RideRequest, ApiError> {
    let pickup = request.pickup_location.trim();
    let dropoff = request.dropoff_location.trim();
    if pickup.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "pickup_location must not be empty",
        ));
    }
    if dropoff.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "dropoff_location must not be empty",
        ));
    }

    let stored = ctx
        .storage
        .append_ride_request(author.user_id, &author.email, pickup, dropoff)
        .await
        .map_err(internal)?;
    info!(
        request_id = %stored.id,
        author = author.user_id.0,
        "feed: ride request published"
    );
    Ok(stored)
}

pub async fn feed_snapshot(ctx: &ApiContext) -> Result<FeedSnapshot, ApiError> {
    let requests = ctx.storage.list_ride_requests().await.map_err(internal)?;
    Ok(FeedSnapshot::new(
        requests.into_iter().map(SnapshotEntry::from).collect(),
    ))
}

fn grant(ctx: &ApiContext, user_id: UserId, email: String) -> Result<AuthGrant, ApiError> {
    let claims = Claims {
        sub: user_id.0,
        email: email.clone(),
        exp: Utc::now().timestamp() + ctx.auth.token_ttl_seconds,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(ctx.auth.jwt_secret.as_bytes()),
    )
    .map_err(|err| ApiError::new(ErrorCode::Internal, format!("token signing failed: {err}")))?;
    Ok(AuthGrant {
        user_id,
        email,
        token,
    })
}

fn normalize_email(email: &str) -> Result<String, ApiError> {
    let email = email.trim().to_ascii_lowercase();
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid {
        return Err(ApiError::new(ErrorCode::Validation, "invalid email address"));
    }
    Ok(email)
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn invalid_credentials() -> ApiError {
    ApiError::new(ErrorCode::Unauthorized, "invalid email or password")
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, e.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
