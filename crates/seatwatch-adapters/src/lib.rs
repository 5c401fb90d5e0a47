//! Availability source + delivery adapters, and the snapshot match extractor.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use seatwatch_core::{Filters, MatchCandidate, QueryKey};
use seatwatch_storage::{FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "seatwatch-adapters";

pub const ETICKET_DEFAULT_BASE_URL: &str = "https://eticket.railway.uz";
pub const TELEGRAM_API_BASE_URL: &str = "https://api.telegram.org";

/// Raw availability payload for one query, as returned by the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub query: QueryKey,
    pub fetched_at: DateTime<Utc>,
    pub body: JsonValue,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetching {query}: {source}")]
    Fetch {
        query: String,
        #[source]
        source: FetchError,
    },
    #[error("decoding snapshot for {query}: {source}")]
    Decode {
        query: String,
        #[source]
        source: serde_json::Error,
    },
}

impl SourceError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            SourceError::Fetch { source, .. } => source.disposition(),
            SourceError::Decode { .. } => RetryDisposition::Retryable,
        }
    }
}

#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(&self, query: &QueryKey) -> Result<RawSnapshot, SourceError>;
}

/// Railway e-ticket handbook API. Each fetch re-bootstraps the session so the
/// anti-forgery token is fresh.
pub struct ETicketSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl ETicketSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn booking_url(&self) -> String {
        format!("{}/ru/", self.base_url)
    }

    async fn xsrf_token(&self) -> Option<String> {
        if let Err(err) = self.http.get(&self.booking_url()).await {
            debug!(error = %err, "session bootstrap request failed");
        }
        match self.http.cookie_value(&self.base_url, "XSRF-TOKEN") {
            Ok(token) => token,
            Err(err) => {
                debug!(error = %err, "reading XSRF-TOKEN cookie failed");
                None
            }
        }
    }
}

pub fn trains_list_payload(query: &QueryKey) -> JsonValue {
    json!({
        "directions": {
            "forward": {
                "date": query.travel_date.format("%Y-%m-%d").to_string(),
                "depStationCode": query.origin_code,
                "arvStationCode": query.destination_code,
            }
        }
    })
}

#[async_trait]
impl AvailabilitySource for ETicketSource {
    fn source_id(&self) -> &'static str {
        "eticket-railway"
    }

    async fn fetch(&self, query: &QueryKey) -> Result<RawSnapshot, SourceError> {
        let xsrf = self.xsrf_token().await;

        let mut headers = vec![
            ("Accept", "application/json".to_string()),
            ("Origin", self.base_url.clone()),
            ("Referer", self.booking_url()),
        ];
        if let Some(token) = xsrf {
            headers.push(("X-XSRF-TOKEN", token));
        }

        let url = format!("{}/api/v3/handbook/trains/list", self.base_url);
        let resp = self
            .http
            .post_json(&url, &trains_list_payload(query), &headers)
            .await
            .map_err(|source| SourceError::Fetch {
                query: query.to_string(),
                source,
            })?;

        let body = serde_json::from_slice(&resp.body).map_err(|source| SourceError::Decode {
            query: query.to_string(),
            source,
        })?;

        Ok(RawSnapshot {
            query: query.clone(),
            fetched_at: Utc::now(),
            body,
        })
    }
}

/// Turns a raw snapshot into ranked candidates for one subscription's filters.
///
/// Every run and fare class is considered; a class is kept when it has at
/// least `min_seats` free seats and, if a price cap is set, its cheapest
/// parsable tariff does not exceed the cap. A class with no parsable tariff is
/// never dropped on price. Missing or oddly-shaped levels yield no candidates.
pub fn extract_matches(body: &JsonValue, filters: &Filters) -> Vec<MatchCandidate> {
    let mut matches = Vec::new();

    for train in json_array(body, &["data", "directions", "forward", "trains"]) {
        for car in json_array(train, &["cars"]) {
            let free_seats = car.get("freeSeats").and_then(json_count).unwrap_or(0);
            if free_seats < filters.min_seats {
                continue;
            }

            let min_fare = json_array(car, &["tariffs"])
                .iter()
                .filter_map(|t| t.get("tariff").and_then(json_fare))
                .min();
            if let (Some(max_price), Some(fare)) = (filters.max_price, min_fare) {
                if fare > max_price {
                    continue;
                }
            }

            matches.push(MatchCandidate {
                run_number: json_text(train, "number"),
                run_type: json_text(train, "type"),
                departure_date: json_text(train, "departureDate"),
                fare_class: fare_class_label(car),
                free_seats,
                min_fare,
            });
        }
    }

    rank_matches(&mut matches);
    matches
}

/// Most seats first; equal seat counts go cheapest first with unknown fares last.
pub fn rank_matches(matches: &mut [MatchCandidate]) {
    matches.sort_by(|a, b| {
        b.free_seats
            .cmp(&a.free_seats)
            .then_with(|| (a.min_fare.is_none(), a.min_fare).cmp(&(b.min_fare.is_none(), b.min_fare)))
    });
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return &[],
        }
    }
    cur.as_array().map(Vec::as_slice).unwrap_or(&[])
}

fn json_text(value: &JsonValue, key: &str) -> String {
    match value.get(key) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn json_count(value: &JsonValue) -> Option<u32> {
    let n = match value {
        JsonValue::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        JsonValue::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    Some(u32::try_from(n).unwrap_or(u32::MAX))
}

// Fractional tariffs round up to whole currency units.
fn json_fare(value: &JsonValue) -> Option<u64> {
    let n = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (n.is_finite() && n >= 0.0).then(|| n.ceil() as u64)
}

fn fare_class_label(car: &JsonValue) -> String {
    let label = json_text(car, "type");
    if label.is_empty() {
        json_text(car, "name")
    } else {
        label
    }
}

/// A button attached to a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotifyAction {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery transport failed: {0}")]
    Transport(#[source] FetchError),
    #[error("delivery rejected with http status {0}")]
    Status(u16),
    #[error("delivery rejected: {0}")]
    Rejected(String),
    #[error("undecodable delivery response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        owner_id: i64,
        text: &str,
        actions: &[NotifyAction],
    ) -> Result<(), NotifyError>;
}

/// Telegram Bot API `sendMessage` delivery; `owner_id` is the chat id.
pub struct TelegramNotifier {
    http: Arc<HttpFetcher>,
    token: String,
    api_base: String,
}

#[derive(Debug, Deserialize)]
struct TelegramReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(http: Arc<HttpFetcher>, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            api_base: TELEGRAM_API_BASE_URL.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }
}

pub fn send_message_payload(chat_id: i64, text: &str, actions: &[NotifyAction]) -> JsonValue {
    let mut payload = json!({
        "chat_id": chat_id,
        "text": text,
        "disable_web_page_preview": true,
    });
    if !actions.is_empty() {
        let rows = actions
            .iter()
            .map(|a| json!([{ "text": a.label, "url": a.url }]))
            .collect::<Vec<_>>();
        payload["reply_markup"] = json!({ "inline_keyboard": rows });
    }
    payload
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(
        &self,
        owner_id: i64,
        text: &str,
        actions: &[NotifyAction],
    ) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let payload = send_message_payload(owner_id, text, actions);

        // The request url embeds the bot token; keep it out of error text.
        let resp = self
            .http
            .post_json(&url, &payload, &[])
            .await
            .map_err(|err| match err {
                FetchError::HttpStatus { status, .. } => NotifyError::Status(status),
                FetchError::Request(inner) => NotifyError::Transport(FetchError::Request(inner.without_url())),
                other => NotifyError::Transport(other),
            })?;

        let reply: TelegramReply = serde_json::from_slice(&resp.body)?;
        if !reply.ok {
            return Err(NotifyError::Rejected(
                reply.description.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(())
    }
}

/// Loads a captured snapshot (`RawSnapshot` serialized as JSON).
pub fn load_snapshot_fixture(path: impl AsRef<Path>) -> Result<RawSnapshot> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
