// Copyright (C) 2026 Outpost Maintainers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use argon2::{
    Argon2, PasswordHasher, PasswordVerifier,
    password_hash::{PasswordHash, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use outpost_common::{
    AddUserRequest, IDLE_EARLY_WARNING_CYCLES, IDLE_POLL_INTERVAL_SECONDS, IDLE_SHUTDOWN_CYCLES,
    LinkedAccount, MessageResponse, REGISTRATION_TTL_SECONDS, SHUTDOWN_GRACE_SECONDS,
    ServerStatusResponse, UserPatch, UserRecord, UserSummary, parse_player_count,
};
use serde::Deserialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{Mutex, RwLock},
    time::{MissedTickBehavior, interval, timeout},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    store: Arc<UserStore>,
    registrations: RegistrationTable,
    community: Arc<dyn CommunityGateway>,
    control: Arc<dyn ServerControl>,
    pepper: Arc<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct MemberProfile {
    display_name: String,
}

/// Out-of-band side of the registration flow: membership lookups and OTP
/// delivery both go through the chat bot.
#[async_trait]
trait CommunityGateway: Send + Sync {
    async fn resolve_member(&self, identity: &str) -> anyhow::Result<Option<MemberProfile>>;
    async fn deliver_otp(&self, identity: &str, otp: &str) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct ChatBotGateway {
    client: reqwest::Client,
    base_url: String,
}

impl ChatBotGateway {
    fn from_env() -> Self {
        let base_url = std::env::var("CHAT_GATEWAY_BASE_URL")
            .ok()
            .unwrap_or_else(|| "http://chat-gateway:8070".to_string());

        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl CommunityGateway for ChatBotGateway {
    async fn resolve_member(&self, identity: &str) -> anyhow::Result<Option<MemberProfile>> {
        let url = self.endpoint(&format!("internal/members/{identity}"));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("failed to call chat gateway")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("chat gateway returned {status}: {body}");
        }

        let member = response
            .json::<MemberProfile>()
            .await
            .context("invalid member payload from chat gateway")?;
        Ok(Some(member))
    }

    async fn deliver_otp(&self, identity: &str, otp: &str) -> anyhow::Result<()> {
        let url = self.endpoint(&format!("internal/members/{identity}/otp"));
        let payload = serde_json::json!({
            "otp": otp,
            "expires_in_seconds": REGISTRATION_TTL_SECONDS,
        });
        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .context("failed to call chat gateway")?;

        if !response.status().is_success() {
            anyhow::bail!("chat gateway returned {} delivering OTP", response.status());
        }
        Ok(())
    }
}

// --- credential hashing ---

fn hash_secret(secret: &str, pepper: &str) -> anyhow::Result<String> {
    let combined = format!("{secret}{pepper}");
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(combined.as_bytes(), &salt)
        .map_err(|error| anyhow::anyhow!("password hashing failed: {error}"))?;
    Ok(hash.to_string())
}

/// Every failure mode collapses to `false`: mismatch, wrong pepper, or a
/// stored value that is not a valid PHC string.
fn verify_secret(secret: &str, pepper: &str, stored: &str) -> bool {
    let combined = format!("{secret}{pepper}");
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(combined.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// --- user store ---

/// Document collection keyed by identity, mirrored to a JSON file on every
/// mutation. Write failures surface to the caller and are never retried.
struct UserStore {
    path: PathBuf,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl UserStore {
    async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let users: HashMap<String, UserRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<UserRecord>>(&bytes)
                .with_context(|| format!("invalid user store file {}", path.display()))?
                .into_iter()
                .map(|record| (record.identity.clone(), record))
                .collect(),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context(format!("failed to read user store file {}", path.display())));
            }
        };

        Ok(Self {
            path,
            users: RwLock::new(users),
        })
    }

    async fn persist(&self, users: &HashMap<String, UserRecord>) -> anyhow::Result<()> {
        let mut records: Vec<&UserRecord> = users.values().collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        let payload = serde_json::to_vec_pretty(&records).context("failed to encode user store")?;
        tokio::fs::write(&self.path, payload)
            .await
            .with_context(|| format!("failed to write user store file {}", self.path.display()))
    }

    async fn find_by_identity(&self, identity: &str) -> Option<UserRecord> {
        self.users.read().await.get(identity).cloned()
    }

    async fn find_by_account_name(&self, account_name: &str) -> Option<UserRecord> {
        self.users
            .read()
            .await
            .values()
            .find(|record| {
                record
                    .account
                    .as_ref()
                    .is_some_and(|account| account.account_name == account_name)
            })
            .cloned()
    }

    /// Membership sync: a no-op when the identity is already present.
    /// Returns whether a record was created.
    async fn insert_if_absent(&self, identity: &str, display_name: &str) -> anyhow::Result<bool> {
        let mut users = self.users.write().await;
        if users.contains_key(identity) {
            return Ok(false);
        }
        users.insert(
            identity.to_string(),
            UserRecord {
                identity: identity.to_string(),
                display_name: display_name.to_string(),
                account: None,
                created_at: Utc::now(),
            },
        );
        self.persist(&users).await?;
        Ok(true)
    }

    /// Shallow merge into an existing record. Does not create: merging into
    /// an absent identity is a no-op and returns `false`.
    async fn merge(&self, identity: &str, patch: UserPatch) -> anyhow::Result<bool> {
        let mut users = self.users.write().await;
        let Some(record) = users.get_mut(identity) else {
            return Ok(false);
        };
        if let Some(display_name) = patch.display_name {
            record.display_name = display_name;
        }
        if let Some(account) = patch.account {
            record.account = Some(account);
        }
        self.persist(&users).await?;
        Ok(true)
    }

    async fn link_account(
        &self,
        identity: &str,
        account_name: &str,
        password_hash: &str,
    ) -> anyhow::Result<bool> {
        self.merge(
            identity,
            UserPatch {
                display_name: None,
                account: Some(LinkedAccount {
                    account_name: account_name.to_string(),
                    password_hash: password_hash.to_string(),
                    linked: true,
                }),
            },
        )
        .await
    }

    async fn delete(&self, identity: &str) -> anyhow::Result<bool> {
        let mut users = self.users.write().await;
        if users.remove(identity).is_none() {
            return Ok(false);
        }
        self.persist(&users).await?;
        Ok(true)
    }

    /// Unsorted order is arbitrary (map iteration order).
    async fn list_all(&self, sorted: bool) -> Vec<UserRecord> {
        let users = self.users.read().await;
        let mut records: Vec<UserRecord> = users.values().cloned().collect();
        if sorted {
            records.sort_by_key(|record| record.display_name.to_lowercase());
        }
        records
    }
}

// --- pending registrations ---

#[derive(Debug, Clone)]
struct PendingRegistration {
    account_name: String,
    password: String,
    /// Generated by the game-mod client and relayed out-of-band; the server
    /// stores it but never validates it.
    otp: String,
    created_at: DateTime<Utc>,
    generation: u64,
}

#[derive(Debug)]
struct AlreadyPending;

/// Table of in-flight registrations, one per identity, each owning a
/// single-shot expiry timer. Every transition runs under the table mutex
/// with no await inside the critical section, so begin/confirm for the same
/// identity cannot interleave mid-mutation.
#[derive(Clone)]
struct RegistrationTable {
    inner: Arc<RegistrationTableInner>,
}

struct RegistrationTableInner {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingRegistration>>,
    next_generation: AtomicU64,
}

impl RegistrationTable {
    fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RegistrationTableInner {
                ttl,
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    async fn is_pending(&self, identity: &str) -> bool {
        self.inner.entries.lock().await.contains_key(identity)
    }

    /// Inserts the pending record and arms its expiry timer. Fails when a
    /// registration is already in flight for this identity.
    async fn insert(
        &self,
        identity: &str,
        account_name: &str,
        password: &str,
        otp: &str,
    ) -> Result<(), AlreadyPending> {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut entries = self.inner.entries.lock().await;
            if entries.contains_key(identity) {
                return Err(AlreadyPending);
            }
            entries.insert(
                identity.to_string(),
                PendingRegistration {
                    account_name: account_name.to_string(),
                    password: password.to_string(),
                    otp: otp.to_string(),
                    created_at: Utc::now(),
                    generation,
                },
            );
        }

        let table = self.clone();
        let identity = identity.to_string();
        let ttl = self.inner.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            table.expire(&identity, generation).await;
        });
        Ok(())
    }

    /// Timer-side removal. A record taken by confirm or reject no longer
    /// carries the timer's generation, so a stale timer firing afterwards is
    /// a no-op even if the identity has re-registered since.
    async fn expire(&self, identity: &str, generation: u64) {
        let mut entries = self.inner.entries.lock().await;
        let owned = entries
            .get(identity)
            .is_some_and(|entry| entry.generation == generation);
        if owned {
            let entry = entries.remove(identity);
            let age_seconds = entry
                .map(|entry| (Utc::now() - entry.created_at).num_seconds())
                .unwrap_or_default();
            info!(identity = %identity, age_seconds, "expired pending registration removed");
        }
    }

    /// Terminal transition: removes and returns the record exactly once.
    async fn take(&self, identity: &str) -> Option<PendingRegistration> {
        self.inner.entries.lock().await.remove(identity)
    }
}

// --- server control channel (RCON) ---

#[async_trait]
trait ServerControl: Send + Sync {
    async fn query_player_count(&self) -> anyhow::Result<u32>;
    async fn query_tick_stats(&self) -> anyhow::Result<String>;
    async fn broadcast(&self, message: &str) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

const RCON_CALL_TIMEOUT: Duration = Duration::from_secs(5);

const RCON_TYPE_RESPONSE: i32 = 0;
const RCON_TYPE_EXEC: i32 = 2;
const RCON_TYPE_AUTH: i32 = 3;
// Auth replies reuse packet type 2 on the wire.
const RCON_TYPE_AUTH_RESPONSE: i32 = 2;

/// Source-RCON client. Connects per call, which keeps the channel
/// self-healing across server restarts.
#[derive(Clone)]
struct RconServerControl {
    addr: String,
    password: String,
}

impl RconServerControl {
    fn from_env() -> Self {
        Self {
            addr: std::env::var("RCON_ADDR")
                .ok()
                .unwrap_or_else(|| "127.0.0.1:25575".to_string()),
            password: std::env::var("RCON_PASSWORD").ok().unwrap_or_default(),
        }
    }

    async fn exec(&self, command: &str) -> anyhow::Result<String> {
        timeout(RCON_CALL_TIMEOUT, self.exec_inner(command))
            .await
            .map_err(|_| {
                anyhow::anyhow!("rcon call timed out after {}s", RCON_CALL_TIMEOUT.as_secs())
            })?
    }

    async fn exec_inner(&self, command: &str) -> anyhow::Result<String> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to rcon at {}", self.addr))?;

        write_rcon_packet(&mut stream, 1, RCON_TYPE_AUTH, &self.password).await?;
        let (auth_id, _, _) = read_rcon_reply(&mut stream, RCON_TYPE_AUTH_RESPONSE).await?;
        if auth_id == -1 {
            anyhow::bail!("rcon authentication rejected");
        }

        write_rcon_packet(&mut stream, 2, RCON_TYPE_EXEC, command).await?;
        let (_, _, body) = read_rcon_reply(&mut stream, RCON_TYPE_RESPONSE).await?;
        Ok(body)
    }
}

async fn write_rcon_packet(
    stream: &mut TcpStream,
    id: i32,
    kind: i32,
    body: &str,
) -> anyhow::Result<()> {
    let mut packet = Vec::with_capacity(body.len() + 14);
    packet.extend_from_slice(&(body.len() as i32 + 10).to_le_bytes());
    packet.extend_from_slice(&id.to_le_bytes());
    packet.extend_from_slice(&kind.to_le_bytes());
    packet.extend_from_slice(body.as_bytes());
    packet.extend_from_slice(&[0, 0]);
    stream
        .write_all(&packet)
        .await
        .context("failed to write rcon packet")
}

async fn read_rcon_packet(stream: &mut TcpStream) -> anyhow::Result<(i32, i32, String)> {
    let mut header = [0_u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .context("failed to read rcon packet length")?;
    let length = i32::from_le_bytes(header);
    if !(10..=4106).contains(&length) {
        anyhow::bail!("rcon packet length {length} out of range");
    }

    let mut payload = vec![0_u8; length as usize];
    stream
        .read_exact(&mut payload)
        .await
        .context("failed to read rcon packet payload")?;
    let id = i32::from_le_bytes(payload[0..4].try_into()?);
    let kind = i32::from_le_bytes(payload[4..8].try_into()?);
    let body = String::from_utf8_lossy(&payload[8..payload.len() - 2]).into_owned();
    Ok((id, kind, body))
}

/// Some servers prefix the auth response with an empty RESPONSE_VALUE
/// packet; skip packets until one of the wanted type arrives.
async fn read_rcon_reply(stream: &mut TcpStream, want: i32) -> anyhow::Result<(i32, i32, String)> {
    for _ in 0..3 {
        let (id, kind, body) = read_rcon_packet(stream).await?;
        if kind == want {
            return Ok((id, kind, body));
        }
    }
    anyhow::bail!("no rcon reply of the expected type")
}

#[async_trait]
impl ServerControl for RconServerControl {
    async fn query_player_count(&self) -> anyhow::Result<u32> {
        let body = self.exec("list").await?;
        parse_player_count(&body)
            .with_context(|| format!("unrecognized player list response: {body}"))
    }

    async fn query_tick_stats(&self) -> anyhow::Result<String> {
        self.exec("tick query").await
    }

    async fn broadcast(&self, message: &str) -> anyhow::Result<()> {
        self.exec(&format!("say {message}")).await.map(|_| ())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.exec("stop").await.map(|_| ())
    }
}

// --- idle-shutdown monitor ---

#[derive(Debug, Default)]
struct IdleTracker {
    consecutive_empty: u32,
    early_warning_sent: bool,
}

#[derive(Debug, PartialEq, Eq)]
enum IdleAction {
    None,
    EarlyWarning,
    Shutdown,
}

impl IdleTracker {
    /// Feeds one poll cycle into the tracker. `None` is an indeterminate
    /// sample (the server could not be observed) and resets the counter
    /// rather than advancing toward a shutdown.
    fn observe(&mut self, players: Option<u32>) -> IdleAction {
        match players {
            None | Some(1..) => {
                self.consecutive_empty = 0;
                self.early_warning_sent = false;
                IdleAction::None
            }
            Some(0) => {
                self.consecutive_empty += 1;
                if self.consecutive_empty >= IDLE_SHUTDOWN_CYCLES {
                    self.consecutive_empty = 0;
                    self.early_warning_sent = false;
                    IdleAction::Shutdown
                } else if self.consecutive_empty == IDLE_EARLY_WARNING_CYCLES
                    && !self.early_warning_sent
                {
                    self.early_warning_sent = true;
                    IdleAction::EarlyWarning
                } else {
                    IdleAction::None
                }
            }
        }
    }
}

async fn run_idle_monitor(control: Arc<dyn ServerControl>, poll_interval: Duration) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tracker = IdleTracker::default();

    loop {
        ticker.tick().await;
        idle_cycle(
            control.as_ref(),
            &mut tracker,
            Duration::from_secs(SHUTDOWN_GRACE_SECONDS),
        )
        .await;
    }
}

async fn idle_cycle(control: &dyn ServerControl, tracker: &mut IdleTracker, grace: Duration) {
    let players = match control.query_player_count().await {
        Ok(count) => Some(count),
        Err(error) => {
            warn!(error = %error, "player count poll failed, idle counter reset");
            None
        }
    };

    match tracker.observe(players) {
        IdleAction::None => {}
        IdleAction::EarlyWarning => {
            info!(
                cycles = IDLE_EARLY_WARNING_CYCLES,
                "server empty, shutdown imminent"
            );
            if let Err(error) = control
                .broadcast("Server is empty and will shut down soon.")
                .await
            {
                warn!(error = %error, "early warning broadcast failed");
            }
        }
        IdleAction::Shutdown => {
            info!(
                grace_seconds = grace.as_secs(),
                "idle threshold reached, shutting the server down"
            );
            if let Err(error) = control
                .broadcast(&format!(
                    "Server shutting down in {} seconds.",
                    grace.as_secs()
                ))
                .await
            {
                warn!(error = %error, "final warning broadcast failed");
            }
            // No cancellation point from here on: a player joining during
            // the grace period does not stop the sequence.
            tokio::time::sleep(grace).await;
            if let Err(error) = control.stop().await {
                warn!(error = %error, "stop command failed");
            }
        }
    }
}

// --- service entry ---

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "link_service=debug,tower_http=info".to_string()),
        )
        .init();

    let pepper = std::env::var("LINK_PEPPER").context("LINK_PEPPER must be set")?;
    let store_path = std::env::var("LINK_STORE_PATH")
        .ok()
        .unwrap_or_else(|| "users.json".to_string());
    let registration_ttl = std::env::var("REGISTRATION_TTL_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(REGISTRATION_TTL_SECONDS)
        .max(1);
    let poll_interval = std::env::var("IDLE_POLL_INTERVAL_SECONDS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(IDLE_POLL_INTERVAL_SECONDS)
        .max(1);

    let store = Arc::new(UserStore::load(PathBuf::from(store_path)).await?);
    let control: Arc<dyn ServerControl> = Arc::new(RconServerControl::from_env());
    let state = AppState {
        store,
        registrations: RegistrationTable::new(Duration::from_secs(registration_ttl)),
        community: Arc::new(ChatBotGateway::from_env()),
        control: control.clone(),
        pepper: Arc::new(pepper),
    };

    tokio::spawn(run_idle_monitor(control, Duration::from_secs(poll_interval)));

    let app = build_router(state);
    let bind_addr = parse_bind_addr("LINK_SERVICE_BIND", "0.0.0.0:8000")?;
    info!(%bind_addr, "link-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register/begin", post(register_begin_handler))
        .route("/register/verify", post(register_verify_handler))
        .route("/login", post(login_handler))
        .route("/user", get(user_lookup_handler))
        .route(
            "/internal/users",
            get(list_users_handler).post(add_user_handler),
        )
        .route("/internal/users/{identity}", delete(delete_user_handler))
        .route("/internal/server/status", get(server_status_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "link-service"}))
}

// --- registration endpoints ---

#[derive(Debug, Deserialize)]
struct RegisterBeginParams {
    account_name: Option<String>,
    identity: Option<String>,
    password: Option<String>,
    otp: Option<String>,
}

async fn register_begin_handler(
    State(state): State<AppState>,
    Query(params): Query<RegisterBeginParams>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let (Some(account_name), Some(identity), Some(password), Some(otp)) = (
        params.account_name,
        params.identity,
        params.password,
        params.otp,
    ) else {
        return Err(ApiError::bad_request("Missing parameters."));
    };
    if account_name.is_empty() || identity.is_empty() || password.is_empty() || otp.is_empty() {
        return Err(ApiError::bad_request("Missing parameters."));
    }

    if state.registrations.is_pending(&identity).await {
        return Err(ApiError::forbidden(format!(
            "There is already an ongoing registration for {identity}."
        )));
    }

    let member = state
        .community
        .resolve_member(&identity)
        .await
        .map_err(|error| {
            warn!(error = %error, "membership lookup failed");
            ApiError::bad_gateway("community membership service unavailable")
        })?;
    let Some(member) = member else {
        return Err(ApiError::forbidden(format!(
            "{identity} is not a member of the community. Join before registering an account."
        )));
    };

    let identity_linked = state
        .store
        .find_by_identity(&identity)
        .await
        .is_some_and(|record| record.account.is_some_and(|account| account.linked));
    if identity_linked {
        return Err(ApiError::forbidden(format!(
            "There is already a game account linked to {identity}."
        )));
    }

    let account_taken = state
        .store
        .find_by_account_name(&account_name)
        .await
        .is_some_and(|record| record.account.is_some_and(|account| account.linked));
    if account_taken {
        return Err(ApiError::forbidden(format!(
            "There is already an identity linked to {account_name}."
        )));
    }

    state
        .store
        .insert_if_absent(&identity, &member.display_name)
        .await
        .map_err(|error| ApiError::internal(format!("user store write failed: {error:#}")))?;

    state
        .community
        .deliver_otp(&identity, &otp)
        .await
        .map_err(|error| {
            warn!(error = %error, "otp delivery failed");
            ApiError::bad_gateway("failed to deliver OTP to the identity owner")
        })?;

    if state
        .registrations
        .insert(&identity, &account_name, &password, &otp)
        .await
        .is_err()
    {
        return Err(ApiError::forbidden(format!(
            "There is already an ongoing registration for {identity}."
        )));
    }

    info!(
        identity = %identity,
        account_name = %account_name,
        "registration accepted, awaiting confirmation"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "Registration request accepted. Waiting for game client confirmation."
                .to_string(),
        }),
    ))
}

#[derive(Debug, Deserialize)]
struct RegisterVerifyParams {
    identity: Option<String>,
    otp_confirmed: Option<String>,
}

async fn register_verify_handler(
    State(state): State<AppState>,
    Query(params): Query<RegisterVerifyParams>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let (Some(identity), Some(raw_confirmed)) = (params.identity, params.otp_confirmed) else {
        return Err(ApiError::bad_request("Missing or invalid parameters."));
    };
    let otp_confirmed = match raw_confirmed.as_str() {
        "true" => true,
        "false" => false,
        _ => return Err(ApiError::bad_request("Missing or invalid parameters.")),
    };

    let Some(registration) = state.registrations.take(&identity).await else {
        return Err(ApiError::not_found(
            "No pending registration for this identity.",
        ));
    };

    if !otp_confirmed {
        info!(identity = %identity, "registration cancelled by caller");
        return Err(ApiError::forbidden(
            "OTP was not confirmed. Registration cancelled.",
        ));
    }

    let password_hash = hash_secret(&registration.password, &state.pepper)
        .map_err(|error| ApiError::internal(format!("password hashing failed: {error:#}")))?;
    let linked = state
        .store
        .link_account(&identity, &registration.account_name, &password_hash)
        .await
        .map_err(|error| ApiError::internal(format!("user store write failed: {error:#}")))?;
    if !linked {
        return Err(ApiError::internal(format!(
            "no user record for {identity}"
        )));
    }

    info!(
        identity = %identity,
        account_name = %registration.account_name,
        "game account linked"
    );
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "Registration completed successfully.".to_string(),
        }),
    ))
}

// --- login and lookup endpoints ---

#[derive(Debug, Deserialize)]
struct LoginParams {
    account_name: Option<String>,
    password: Option<String>,
}

async fn login_handler(
    State(state): State<AppState>,
    Query(params): Query<LoginParams>,
) -> Result<Json<MessageResponse>, ApiError> {
    let (Some(account_name), Some(password)) = (params.account_name, params.password) else {
        return Err(ApiError::bad_request("Missing parameters."));
    };

    let Some(record) = state.store.find_by_account_name(&account_name).await else {
        return Err(ApiError::not_found("Non-existent account."));
    };
    let Some(account) = record.account else {
        return Err(ApiError::not_found("Non-existent account."));
    };

    if verify_secret(&password, &state.pepper, &account.password_hash) {
        Ok(Json(MessageResponse {
            message: "Login successful.".to_string(),
        }))
    } else {
        Err(ApiError::forbidden("Invalid credentials."))
    }
}

#[derive(Debug, Deserialize)]
struct UserLookupParams {
    account_name: Option<String>,
}

/// Reveals only existence, never linkage details or hashes.
async fn user_lookup_handler(
    State(state): State<AppState>,
    Query(params): Query<UserLookupParams>,
) -> Result<Json<MessageResponse>, ApiError> {
    let Some(account_name) = params.account_name else {
        return Err(ApiError::bad_request("Missing parameters."));
    };

    if state
        .store
        .find_by_account_name(&account_name)
        .await
        .is_some()
    {
        Ok(Json(MessageResponse {
            message: "Account exists.".to_string(),
        }))
    } else {
        Err(ApiError::not_found("Account does not exist."))
    }
}

// --- internal surface for the chat-bot adapter ---

#[derive(Debug, Deserialize)]
struct ListUsersParams {
    sorted: Option<bool>,
}

async fn list_users_handler(
    State(state): State<AppState>,
    Query(params): Query<ListUsersParams>,
) -> Json<Vec<UserSummary>> {
    let records = state.store.list_all(params.sorted.unwrap_or(false)).await;
    Json(records.iter().map(UserSummary::from).collect())
}

async fn add_user_handler(
    State(state): State<AppState>,
    Json(request): Json<AddUserRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    if request.identity.is_empty() || request.display_name.is_empty() {
        return Err(ApiError::bad_request("Missing parameters."));
    }

    let created = state
        .store
        .insert_if_absent(&request.identity, &request.display_name)
        .await
        .map_err(|error| ApiError::internal(format!("user store write failed: {error:#}")))?;

    if created {
        info!(identity = %request.identity, "user added");
        Ok((
            StatusCode::CREATED,
            Json(MessageResponse {
                message: "User added.".to_string(),
            }),
        ))
    } else {
        Ok((
            StatusCode::OK,
            Json(MessageResponse {
                message: "User already present.".to_string(),
            }),
        ))
    }
}

async fn delete_user_handler(
    State(state): State<AppState>,
    Path(identity): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let removed = state
        .store
        .delete(&identity)
        .await
        .map_err(|error| ApiError::internal(format!("user store write failed: {error:#}")))?;

    if removed {
        info!(identity = %identity, "user removed");
        Ok(Json(MessageResponse {
            message: "User removed.".to_string(),
        }))
    } else {
        Err(ApiError::not_found(format!(
            "no user record for {identity}"
        )))
    }
}

async fn server_status_handler(
    State(state): State<AppState>,
) -> Result<Json<ServerStatusResponse>, ApiError> {
    let players = state.control.query_player_count().await.map_err(|error| {
        warn!(error = %error, "player count query failed");
        ApiError::bad_gateway("game server unreachable")
    })?;

    let tick = match state.control.query_tick_stats().await {
        Ok(stats) => Some(stats),
        Err(error) => {
            warn!(error = %error, "tick stats query failed");
            None
        }
    };

    Ok(Json(ServerStatusResponse {
        online: true,
        players,
        tick,
    }))
}

// --- error boundary ---

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}
