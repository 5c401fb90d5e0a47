//! Subscription persistence + HTTP fetch utilities for seatwatch.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use percent_encoding::percent_decode_str;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{StatusCode, Url};
use seatwatch_core::{
    DecisionState, Filters, NewSubscription, QuietWindow, Station, Subscription,
};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "seatwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt subscription row {id}: {reason}")]
    Corrupt { id: i64, reason: String },
    #[error("value out of range: {0}")]
    OutOfRange(String),
}

/// Durable subscription records. Every write is scoped by id and owner so a
/// state update never touches another subscriber's row.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError>;

    async fn get(&self, id: i64, owner_id: i64) -> Result<Option<Subscription>, StoreError>;

    /// Returns `false` when the row no longer exists (deleted mid-tick).
    async fn update_decision_state(
        &self,
        id: i64,
        owner_id: i64,
        state: &DecisionState,
    ) -> Result<bool, StoreError>;

    async fn create(&self, new: NewSubscription) -> Result<Subscription, StoreError>;

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Subscription>, StoreError>;

    async fn delete(&self, id: i64, owner_id: i64) -> Result<bool, StoreError>;

    async fn set_active(&self, id: i64, owner_id: i64, active: bool) -> Result<bool, StoreError>;

    /// Applies the window to every subscription of the owner; returns rows touched.
    async fn set_quiet_window(&self, owner_id: i64, window: &QuietWindow) -> Result<u64, StoreError>;
}

const SUBSCRIPTION_COLUMNS: &str = "id, owner_id, \
     origin_key, origin_code, origin_label, \
     destination_key, destination_code, destination_label, \
     travel_date, min_seats, max_price, \
     quiet_enabled, quiet_start, quiet_end, active, \
     last_available, last_signature, last_notified_at, created_at";

#[derive(Debug, Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, StoreError> {
    let id: i64 = row.try_get("id")?;
    let min_seats: i32 = row.try_get("min_seats")?;
    let max_price: Option<i64> = row.try_get("max_price")?;

    let min_seats = u32::try_from(min_seats).map_err(|_| StoreError::Corrupt {
        id,
        reason: format!("min_seats {min_seats}"),
    })?;
    let max_price = max_price
        .map(u64::try_from)
        .transpose()
        .map_err(|_| StoreError::Corrupt {
            id,
            reason: "negative max_price".to_string(),
        })?;
    let filters = Filters::new(min_seats, max_price).map_err(|err| StoreError::Corrupt {
        id,
        reason: err.to_string(),
    })?;

    let quiet_start: NaiveTime = row.try_get("quiet_start")?;
    let quiet_end: NaiveTime = row.try_get("quiet_end")?;
    let travel_date: NaiveDate = row.try_get("travel_date")?;

    Ok(Subscription {
        id,
        owner_id: row.try_get("owner_id")?,
        origin: Station {
            key: row.try_get("origin_key")?,
            code: row.try_get("origin_code")?,
            label: row.try_get("origin_label")?,
        },
        destination: Station {
            key: row.try_get("destination_key")?,
            code: row.try_get("destination_code")?,
            label: row.try_get("destination_label")?,
        },
        travel_date,
        filters,
        quiet: QuietWindow {
            enabled: row.try_get("quiet_enabled")?,
            start: quiet_start,
            end: quiet_end,
        },
        active: row.try_get("active")?,
        state: DecisionState {
            last_available: row.try_get("last_available")?,
            last_signature: row.try_get("last_signature")?,
            last_notified_at: row.try_get("last_notified_at")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn to_db_seats(min_seats: u32) -> Result<i32, StoreError> {
    i32::try_from(min_seats).map_err(|_| StoreError::OutOfRange(format!("min_seats {min_seats}")))
}

fn to_db_price(max_price: Option<u64>) -> Result<Option<i64>, StoreError> {
    max_price
        .map(|p| i64::try_from(p).map_err(|_| StoreError::OutOfRange(format!("max_price {p}"))))
        .transpose()
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        let sql = format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE active ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn get(&self, id: i64, owner_id: i64) -> Result<Option<Subscription>, StoreError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 AND owner_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn update_decision_state(
        &self,
        id: i64,
        owner_id: i64,
        state: &DecisionState,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
               SET last_available = $3,
                   last_signature = $4,
                   last_notified_at = $5
             WHERE id = $1 AND owner_id = $2
            "#,
        )
        .bind(id)
        .bind(owner_id)
        .bind(state.last_available)
        .bind(state.last_signature.as_deref())
        .bind(state.last_notified_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create(&self, new: NewSubscription) -> Result<Subscription, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO subscriptions (
                owner_id,
                origin_key, origin_code, origin_label,
                destination_key, destination_code, destination_label,
                travel_date, min_seats, max_price,
                quiet_enabled, quiet_start, quiet_end
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(new.owner_id)
            .bind(&new.origin.key)
            .bind(&new.origin.code)
            .bind(&new.origin.label)
            .bind(&new.destination.key)
            .bind(&new.destination.code)
            .bind(&new.destination.label)
            .bind(new.travel_date)
            .bind(to_db_seats(new.filters.min_seats)?)
            .bind(to_db_price(new.filters.max_price)?)
            .bind(new.quiet.enabled)
            .bind(new.quiet.start)
            .bind(new.quiet.end)
            .fetch_one(&self.pool)
            .await?;
        subscription_from_row(&row)
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let sql = format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE owner_id = $1 ORDER BY id DESC"
        );
        let rows = sqlx::query(&sql).bind(owner_id).fetch_all(&self.pool).await?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn delete(&self, id: i64, owner_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1 AND owner_id = $2")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_active(&self, id: i64, owner_id: i64, active: bool) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE subscriptions SET active = $3 WHERE id = $1 AND owner_id = $2")
                .bind(id)
                .bind(owner_id)
                .bind(active)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_quiet_window(&self, owner_id: i64, window: &QuietWindow) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
               SET quiet_enabled = $2, quiet_start = $3, quiet_end = $4
             WHERE owner_id = $1
            "#,
        )
        .bind(owner_id)
        .bind(window.enabled)
        .bind(window.start)
        .bind(window.end)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySubscriptionStore {
    inner: Mutex<MemoryRows>,
}

#[derive(Debug, Default)]
struct MemoryRows {
    last_id: i64,
    rows: BTreeMap<i64, Subscription>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fully-formed record as-is, keeping its id.
    pub async fn insert(&self, subscription: Subscription) {
        let mut inner = self.inner.lock().await;
        inner.last_id = inner.last_id.max(subscription.id);
        inner.rows.insert(subscription.id, subscription);
    }

    pub async fn all(&self) -> Vec<Subscription> {
        self.inner.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn list_active(&self) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.rows.values().filter(|s| s.active).cloned().collect())
    }

    async fn get(&self, id: i64, owner_id: i64) -> Result<Option<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .get(&id)
            .filter(|s| s.owner_id == owner_id)
            .cloned())
    }

    async fn update_decision_state(
        &self,
        id: i64,
        owner_id: i64,
        state: &DecisionState,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.rows.get_mut(&id).filter(|s| s.owner_id == owner_id) {
            Some(sub) => {
                sub.state = state.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create(&self, new: NewSubscription) -> Result<Subscription, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.last_id += 1;
        let subscription = Subscription {
            id: inner.last_id,
            owner_id: new.owner_id,
            origin: new.origin,
            destination: new.destination,
            travel_date: new.travel_date,
            filters: new.filters,
            quiet: new.quiet,
            active: true,
            state: DecisionState::default(),
            created_at: Utc::now(),
        };
        inner.rows.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn list_for_owner(&self, owner_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .rows
            .values()
            .rev()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: i64, owner_id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let owned = inner.rows.get(&id).is_some_and(|s| s.owner_id == owner_id);
        if owned {
            inner.rows.remove(&id);
        }
        Ok(owned)
    }

    async fn set_active(&self, id: i64, owner_id: i64, active: bool) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.rows.get_mut(&id).filter(|s| s.owner_id == owner_id) {
            Some(sub) => {
                sub.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_quiet_window(&self, owner_id: i64, window: &QuietWindow) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut touched = 0;
        for sub in inner.rows.values_mut().filter(|s| s.owner_id == owner_id) {
            sub.quiet = *window;
            touched += 1;
        }
        Ok(touched)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {0}")]
    InvalidUrl(String),
}

impl FetchError {
    /// Whether the next tick is likely to succeed where this one failed.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::InvalidUrl(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Cookie-aware HTTP client shared by source and delivery adapters. No retry
/// loop: a failed request is retried by the next polling tick.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    jar: Arc<Jar>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let jar = Arc::new(Jar::default());
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_provider(jar.clone())
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self { client, jar })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let request = self.client.get(url);
        self.send(request, url)
            .instrument(info_span!("http_fetch", method = "GET", host = %host_of(url)))
            .await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&'static str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        self.send(request, url)
            .instrument(info_span!("http_fetch", method = "POST", host = %host_of(url)))
            .await
    }

    /// Looks up a cookie previously set for `url`, percent-decoded.
    pub fn cookie_value(&self, url: &str, name: &str) -> Result<Option<String>, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let Some(header) = self.jar.cookies(&parsed) else {
            return Ok(None);
        };
        Ok(header
            .to_str()
            .ok()
            .and_then(|raw| find_cookie(raw, name)))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

// Paths can carry credentials (bot tokens), so spans only record the host.
fn host_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Picks `name` out of a `Cookie:` header value (`a=1; b=2`).
pub fn find_cookie(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| percent_decode_str(value).decode_utf8_lossy().into_owned())
    })
}
