//! Content rendering: authenticated fetch of the watched list
//!
//! The renderer performs one poll on behalf of an acquired identity, routed
//! through an optional egress path, and returns the raw response pages. It
//! follows the provider's pagination cursor for up to the configured number of
//! load cycles, pacing requests with a local rate limiter. Session login also
//! lives here, behind the [`SessionBroker`] seam so the pool can bootstrap
//! identities without knowing how sessions are made.

use async_trait::async_trait;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::{Client, Proxy, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::models::RawPayload;
use crate::pool::{CredentialRef, EgressLease, IdentityLease, SessionHandle};

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Errors from fetch and login operations
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with an explicit rate-limit status
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Non-success status outside the recognized cases
    #[error("server error: status {0}")]
    Status(u16),

    /// Request exceeded its deadline
    #[error("request timeout")]
    Timeout,

    /// Connection refused, handshake failure, proxy unreachable
    #[error("connection failed: {0}")]
    Connect(String),

    /// The session is no longer accepted by the provider
    #[error("authentication expired or rejected")]
    AuthExpired,

    /// Login attempt was rejected
    #[error("login rejected: {0}")]
    LoginRejected(String),

    /// Credential environment variable is not set
    #[error("credential variable not set: {0}")]
    MissingCredential(String),

    /// Malformed target or egress URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether this failure happened at the connectivity level and should be
    /// attributed to the egress path rather than the identity
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

/// Performs one authenticated fetch of the watched list
#[async_trait]
pub trait ContentRenderer: Send + Sync {
    async fn fetch(
        &self,
        identity: &IdentityLease,
        egress: Option<&EgressLease>,
    ) -> Result<RawPayload, FetchError>;
}

/// Establishes a session for an identity
#[async_trait]
pub trait SessionBroker: Send + Sync {
    async fn login(&self, id: &str, credential: &CredentialRef)
        -> Result<SessionHandle, FetchError>;
}

/// HTTP implementation of the renderer and session broker
pub struct HttpRenderer {
    target: Url,
    login_url: Url,
    /// Additional load cycles to follow after the initial page
    max_scrolls: u32,
    request_timeout: Duration,
    pacer: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl HttpRenderer {
    pub fn new(
        target: &str,
        login_url: &str,
        max_scrolls: u32,
        request_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let target = Url::parse(target).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let login_url = Url::parse(login_url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let quota = Quota::per_second(NonZeroU32::new(1).expect("1 is non-zero"));

        Ok(Self {
            target,
            login_url,
            max_scrolls,
            request_timeout,
            pacer: RateLimiter::direct(quota),
        })
    }

    fn build_client(
        &self,
        session: Option<&SessionHandle>,
        egress: Option<&EgressLease>,
    ) -> Result<Client, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        if let Some(session) = session {
            let cookie = cookie_header(session);
            if !cookie.is_empty() {
                let value = HeaderValue::from_str(&cookie)
                    .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
                headers.insert(COOKIE, value);
            }
        }

        let mut builder = Client::builder()
            .timeout(self.request_timeout)
            .gzip(true)
            .default_headers(headers);

        if let Some(egress) = egress {
            let mut proxy = Proxy::all(&egress.descriptor.url)?;
            if let (Some(user_env), Some(pass_env)) = (
                egress.descriptor.username_env.as_deref(),
                egress.descriptor.password_env.as_deref(),
            ) {
                if let (Ok(user), Ok(pass)) =
                    (std::env::var(user_env), std::env::var(pass_env))
                {
                    proxy = proxy.basic_auth(&user, &pass);
                }
            }
            builder = builder.proxy(proxy);
        }

        Ok(builder.build()?)
    }

    async fn fetch_page(
        &self,
        client: &Client,
        cursor: Option<&str>,
    ) -> Result<Value, FetchError> {
        self.pacer.until_ready().await;

        let mut request = client.get(self.target.clone());
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(FetchError::RateLimited(format!("status 429: {snippet}")));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::AuthExpired);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response.json().await.map_err(map_transport_error)
    }
}

#[async_trait]
impl ContentRenderer for HttpRenderer {
    async fn fetch(
        &self,
        identity: &IdentityLease,
        egress: Option<&EgressLease>,
    ) -> Result<RawPayload, FetchError> {
        let client = self.build_client(identity.session.as_ref(), egress)?;

        let mut pages = Vec::new();
        let mut cursor: Option<String> = None;

        for cycle in 0..=self.max_scrolls {
            let page = self.fetch_page(&client, cursor.as_deref()).await?;
            let next = bottom_cursor(&page);
            let had_items = has_items(&page);
            pages.push(page);

            if !had_items || next.is_none() {
                break;
            }
            cursor = next;
            debug!(identity = %identity.id, cycle, "following pagination cursor");
        }

        let scroll_cycles = (pages.len() as u32).saturating_sub(1);
        Ok(RawPayload {
            pages,
            scroll_cycles,
        })
    }
}

#[async_trait]
impl SessionBroker for HttpRenderer {
    async fn login(
        &self,
        id: &str,
        credential: &CredentialRef,
    ) -> Result<SessionHandle, FetchError> {
        let username = std::env::var(&credential.username_env)
            .map_err(|_| FetchError::MissingCredential(credential.username_env.clone()))?;
        let password = std::env::var(&credential.password_env)
            .map_err(|_| FetchError::MissingCredential(credential.password_env.clone()))?;

        self.pacer.until_ready().await;
        let client = self.build_client(None, None)?;

        info!(identity = %id, "logging in");
        let response = client
            .post(self.login_url.clone())
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::LoginRejected(format!("status {status}")));
        }

        let cookies = collect_cookies(response.headers());
        if cookies.is_empty() {
            return Err(FetchError::LoginRejected("no session cookies issued".into()));
        }

        let serialized = serde_json::to_string(&cookies)
            .map_err(|e| FetchError::LoginRejected(e.to_string()))?;
        Ok(SessionHandle(serialized))
    }
}

fn map_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_connect() {
        FetchError::Connect(err.to_string())
    } else {
        FetchError::Http(err)
    }
}

/// Assemble a Cookie header from a session handle. Handles are stored as a
/// JSON name/value map; anything else is passed through verbatim so manually
/// exported headers keep working.
fn cookie_header(session: &SessionHandle) -> String {
    match serde_json::from_str::<BTreeMap<String, String>>(&session.0) {
        Ok(map) => map
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; "),
        Err(_) => session.0.clone(),
    }
}

fn collect_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();
    for value in headers.get_all(SET_COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        let pair = raw.split(';').next().unwrap_or_default();
        if let Some((name, value)) = pair.split_once('=') {
            cookies.insert(name.trim().to_string(), value.trim().to_string());
        }
    }
    cookies
}

fn entries_of(page: &Value) -> impl Iterator<Item = &Value> {
    page.pointer("/data/list/tweets_timeline/timeline/instructions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|instruction| instruction.get("entries").and_then(Value::as_array))
        .flatten()
}

/// Whether a page carried any list items
fn has_items(page: &Value) -> bool {
    entries_of(page).any(|entry| {
        entry
            .get("entryId")
            .and_then(Value::as_str)
            .is_some_and(|id| id.starts_with("tweet-"))
    })
}

/// Find the bottom pagination cursor on a page, if any
fn bottom_cursor(page: &Value) -> Option<String> {
    entries_of(page).find_map(|entry| {
        let entry_id = entry.get("entryId").and_then(Value::as_str)?;
        if !entry_id.starts_with("cursor-bottom") {
            return None;
        }
        entry
            .pointer("/content/value")
            .or_else(|| entry.pointer("/content/itemContent/value"))
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}
