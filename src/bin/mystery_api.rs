//! mystery_api: the HTTP façade for the Mystery Protocol (C6).
//!
//! Public endpoints (JSON unless noted):
//! - POST /submit_challenge_data        multipart: file + unencrypted_mapping, user_id,
//!                                       key_name, key_index, segments -> 201 { id }
//! - POST /get_authentication_challenge { user_id, key_name, timeout_minutes } ->
//!                                       200 { session_token, mapping, expires_at, secret_length }
//! - POST /verify_solution               { session_token, target_sequence, verifier_private_key } ->
//!                                       200 { is_match, prize_value }
//! - GET  /session_status/:token        -> 200 session state
//! - GET  /rate_limit_status/:token     -> 200 rate-limit budget
//! - GET  /stats                         -> 200 aggregate counters
//!
//! This binary only serializes/deserializes and translates typed core errors
//! into HTTP status codes (§7); it holds no cryptographic logic of its own.

#![forbid(unsafe_code)]

use std::net::SocketAddr;

use axum::{
    extract::{Multipart, Path, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use mystery_protocol::alphabet::Mapping;
use mystery_protocol::config::Config;
use mystery_protocol::store::{Store, StoreError};

#[derive(Clone)]
struct AppState {
    store: Store,
    config: Config,
}

#[derive(Serialize)]
struct ErrorRes {
    error: String,
}

fn error_response(err: impl std::fmt::Display, status: StatusCode) -> (StatusCode, Json<ErrorRes>) {
    (
        status,
        Json(ErrorRes {
            error: err.to_string(),
        }),
    )
}

/// Maps a [`StoreError`] to the HTTP status documented in §7. Every
/// precondition failure is logged at the level the specification assigns
/// it; no private key material or plaintext secret ever reaches this layer.
fn store_error_response(err: StoreError) -> (StatusCode, Json<ErrorRes>) {
    let status = match &err {
        StoreError::InvalidPackage(_) | StoreError::Alphabet(_) | StoreError::InvalidKey => {
            StatusCode::BAD_REQUEST
        }
        StoreError::DuplicateFile { .. } | StoreError::DuplicateMapping { .. } => {
            warn!(%err, "duplicate submission rejected");
            StatusCode::CONFLICT
        }
        StoreError::NoPackage | StoreError::UnknownSession => StatusCode::NOT_FOUND,
        StoreError::SessionClosed(_) => StatusCode::GONE,
        StoreError::RateLimited => {
            warn!(%err, "rate limit exceeded");
            StatusCode::TOO_MANY_REQUESTS
        }
        StoreError::AlreadyUnlocked => {
            warn!(%err, "already-unlocked mapping sequence rejected");
            StatusCode::CONFLICT
        }
        StoreError::Protocol(_) => {
            error!(%err, "protocol engine error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(err, status)
}

#[derive(Serialize)]
struct SubmitRes {
    id: Uuid,
}

async fn submit_challenge_data(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<SubmitRes>), (StatusCode, Json<ErrorRes>)> {
    let mut compressed_package: Option<Vec<u8>> = None;
    let mut unencrypted_mapping: Option<Vec<Mapping>> = None;
    let mut user_id: Option<Uuid> = None;
    let mut key_name: Option<String> = None;
    let mut key_index: Option<i64> = None;
    let mut segments: Option<usize> = None;
    let mut secret_length: Option<u32> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?;
                compressed_package = Some(data.to_vec());
            }
            "unencrypted_mapping" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?;
                let mapping: Vec<Mapping> = serde_json::from_str(&text)
                    .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?;
                unencrypted_mapping = Some(mapping);
            }
            "user_id" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?;
                user_id = Some(
                    text.parse()
                        .map_err(|_| error_response("invalid user_id", StatusCode::BAD_REQUEST))?,
                );
            }
            "key_name" => {
                key_name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?,
                );
            }
            "key_index" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?;
                key_index = Some(
                    text.parse()
                        .map_err(|_| error_response("invalid key_index", StatusCode::BAD_REQUEST))?,
                );
            }
            "segments" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?;
                segments = Some(
                    text.parse()
                        .map_err(|_| error_response("invalid segments", StatusCode::BAD_REQUEST))?,
                );
            }
            "secret_length" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| error_response(e, StatusCode::BAD_REQUEST))?;
                secret_length = text.parse().ok();
            }
            _ => {}
        }
    }

    let compressed_package = compressed_package
        .ok_or_else(|| error_response("multipart field 'file' is required", StatusCode::BAD_REQUEST))?;
    let unencrypted_mapping = unencrypted_mapping.ok_or_else(|| {
        error_response(
            "multipart field 'unencrypted_mapping' is required",
            StatusCode::BAD_REQUEST,
        )
    })?;
    let user_id =
        user_id.ok_or_else(|| error_response("multipart field 'user_id' is required", StatusCode::BAD_REQUEST))?;
    let key_name = key_name
        .ok_or_else(|| error_response("multipart field 'key_name' is required", StatusCode::BAD_REQUEST))?;
    let key_index = key_index
        .ok_or_else(|| error_response("multipart field 'key_index' is required", StatusCode::BAD_REQUEST))?;
    let segments = segments.unwrap_or(state.config.segments);

    let id = state
        .store
        .submit(
            compressed_package,
            unencrypted_mapping,
            user_id,
            key_name,
            key_index,
            segments,
            secret_length,
        )
        .map_err(store_error_response)?;

    Ok((StatusCode::CREATED, Json(SubmitRes { id })))
}

#[derive(Deserialize)]
struct ChallengeReq {
    user_id: Uuid,
    key_name: String,
    #[serde(default)]
    timeout_minutes: Option<i64>,
}

#[derive(Serialize)]
struct ChallengeRes {
    session_token: String,
    mapping: Vec<Mapping>,
    expires_at: DateTime<Utc>,
    secret_length: Option<u32>,
}

async fn get_authentication_challenge(
    State(state): State<AppState>,
    Json(req): Json<ChallengeReq>,
) -> Result<Json<ChallengeRes>, (StatusCode, Json<ErrorRes>)> {
    let timeout_minutes = req
        .timeout_minutes
        .unwrap_or(state.config.default_timeout_minutes);
    let issued = state
        .store
        .issue_challenge(req.user_id, &req.key_name, timeout_minutes)
        .map_err(store_error_response)?;

    Ok(Json(ChallengeRes {
        session_token: issued.session_token,
        mapping: issued.mapping,
        expires_at: issued.expires_at,
        secret_length: issued.secret_length,
    }))
}

#[derive(Deserialize)]
struct VerifyReq {
    session_token: String,
    target_sequence: Vec<u64>,
    verifier_private_key: String,
}

#[derive(Serialize)]
struct VerifyRes {
    is_match: bool,
    prize_value: Option<String>,
}

async fn verify_solution(
    State(state): State<AppState>,
    Json(req): Json<VerifyReq>,
) -> Result<Json<VerifyRes>, (StatusCode, Json<ErrorRes>)> {
    let outcome = state
        .store
        .verify(&req.session_token, &req.target_sequence, &req.verifier_private_key)
        .map_err(store_error_response)?;

    if outcome.is_match && outcome.prize.is_none() {
        error!("verification matched but prize was unrecoverable (RS decode failure)");
    }

    Ok(Json(VerifyRes {
        is_match: outcome.is_match,
        prize_value: outcome.prize.map(|p| p.to_decimal_string()),
    }))
}

#[derive(Serialize)]
struct SessionStatusRes {
    is_verified: bool,
    attempts: u32,
    max_attempts: u32,
    expires_at: DateTime<Utc>,
    closed: Option<String>,
}

async fn session_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<SessionStatusRes>, (StatusCode, Json<ErrorRes>)> {
    let status = state.store.session_status(&token).map_err(store_error_response)?;
    Ok(Json(SessionStatusRes {
        is_verified: status.is_verified,
        attempts: status.attempts,
        max_attempts: status.max_attempts,
        expires_at: status.expires_at,
        closed: status.closed.map(|c| format!("{c:?}")),
    }))
}

#[derive(Serialize)]
struct RateLimitStatusRes {
    failed_attempts_last_hour: usize,
    limit: usize,
    remaining: usize,
}

async fn rate_limit_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<RateLimitStatusRes>, (StatusCode, Json<ErrorRes>)> {
    let status = state
        .store
        .rate_limit_status(&token)
        .map_err(store_error_response)?;
    Ok(Json(RateLimitStatusRes {
        failed_attempts_last_hour: status.failed_attempts_last_hour,
        limit: status.limit,
        remaining: status.remaining,
    }))
}

#[derive(Serialize)]
struct StatsRes {
    total_files: usize,
    used_files: usize,
    total_sessions: usize,
    verified_sessions: usize,
    total_attempts: usize,
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let s = state.store.stats();
    Json(StatsRes {
        total_files: s.total_files,
        used_files: s.used_files,
        total_sessions: s.total_sessions,
        verified_sessions: s.verified_sessions,
        total_attempts: s.total_attempts,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "mystery_api=info,tower_http=info".into()))
        .with_target(false)
        .compact()
        .init();

    info!("starting mystery_api server");

    let config = Config::from_env();
    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

    let allowed_origins = std::env::var("MYSTERY_CORS_ALLOWED_ORIGINS").unwrap_or_default();
    let cors = if allowed_origins.is_empty() {
        warn!("MYSTERY_CORS_ALLOWED_ORIGINS unset; defaulting to permissive CORS");
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = allowed_origins
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    };

    let governor_conf = Box::leak(Box::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(30)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .expect("static governor configuration is valid"),
    ));

    let state = AppState {
        store: Store::new(),
        config,
    };

    let app = Router::new()
        .route("/submit_challenge_data", post(submit_challenge_data))
        .route("/get_authentication_challenge", post(get_authentication_challenge))
        .route("/verify_solution", post(verify_solution))
        .route("/session_status/:token", get(session_status))
        .route("/rate_limit_status/:token", get(rate_limit_status))
        .route("/stats", get(stats))
        .layer(GovernorLayer {
            config: governor_conf,
        })
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    info!(%addr, "mystery_api listening");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
