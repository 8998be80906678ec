//! Boundary implementations: the authoritative source dataset and the
//! external table service.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};

use lbx_core::{
    NaturalKey, SourceRecord, SyncCheckpoint, TargetPage, TargetPayload, TargetRecordId, TargetRow,
};
use lbx_storage::{
    build_http_client, CheckpointStore, HttpClientConfig, RateGate, StoreError, TokenBucketConfig,
};

pub const CRATE_NAME: &str = "lbx-adapters";

/// Pure, repeatable read over the authoritative dataset, ascending by
/// normalized natural key with the predicate `key > cursor`.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn list_since(
        &self,
        cursor: Option<&NaturalKey>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError>;
}

/// The external table service surface the engine writes through.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn list_page(&self, offset: Option<&str>) -> Result<TargetPage, StoreError>;

    async fn create_batch(
        &self,
        payloads: &[TargetPayload],
    ) -> Result<Vec<TargetRecordId>, StoreError>;

    async fn delete_batch(&self, ids: &[TargetRecordId]) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone)]
pub struct TableServiceConfig {
    pub base_url: String,
    pub api_key: String,
    pub table: String,
    pub page_size: usize,
    pub http: HttpClientConfig,
}

impl TableServiceConfig {
    pub fn from_env() -> Self {
        let requests_per_second: Option<u32> = std::env::var("LBX_TABLE_RPS")
            .ok()
            .and_then(|v| v.parse().ok());
        let http = HttpClientConfig {
            timeout: Duration::from_secs(
                std::env::var("LBX_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
            user_agent: Some(
                std::env::var("LBX_USER_AGENT").unwrap_or_else(|_| "lbx-bot/0.1".to_string()),
            ),
            max_inflight: std::env::var("LBX_MAX_INFLIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            token_bucket: requests_per_second.filter(|rps| *rps > 0).map(|rps| {
                TokenBucketConfig {
                    capacity: rps,
                    refill_every: Duration::from_millis(1000 / u64::from(rps).max(1)),
                }
            }),
        };

        Self {
            base_url: std::env::var("LBX_TABLE_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8642/v0".to_string()),
            api_key: std::env::var("LBX_TABLE_API_KEY").unwrap_or_default(),
            table: std::env::var("LBX_TABLE_NAME").unwrap_or_else(|_| "Businesses".to_string()),
            page_size: std::env::var("LBX_TABLE_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: String,
    #[serde(default)]
    fields: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    records: Vec<WireRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    records: Vec<CreateRecord<'a>>,
}

#[derive(Debug, Serialize)]
struct CreateRecord<'a> {
    fields: &'a TargetPayload,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    records: Vec<WireRecord>,
}

#[derive(Debug, Deserialize)]
struct DeletedRecord {
    #[allow(dead_code)]
    id: String,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct DeleteResponse {
    records: Vec<DeletedRecord>,
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// HTTP client for the spreadsheet-style table service. Performs exactly
/// one call per method; retry discipline lives in the engine. Every call
/// passes the shared rate gate first.
pub struct HttpTableStore {
    client: reqwest::Client,
    gate: RateGate,
    table_url: reqwest::Url,
    api_key: String,
    page_size: usize,
}

impl HttpTableStore {
    pub fn new(config: TableServiceConfig) -> Result<Self> {
        let client = build_http_client(&config.http)?;
        let base = format!("{}/", config.base_url.trim_end_matches('/'));
        let table_url = reqwest::Url::parse(&base)
            .and_then(|url| url.join(&config.table))
            .with_context(|| format!("invalid table service url {}/{}", config.base_url, config.table))?;

        Ok(Self {
            client,
            gate: RateGate::new(config.http.max_inflight, config.http.token_bucket),
            table_url,
            api_key: config.api_key,
            page_size: config.page_size,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            request
        } else {
            request.bearer_auth(&self.api_key)
        }
    }

    async fn check(
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<reqwest::Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(StoreError::Status {
            status: status.as_u16(),
            endpoint: endpoint.to_string(),
            retry_after: parse_retry_after(response.headers()),
        })
    }
}

#[async_trait]
impl TargetStore for HttpTableStore {
    async fn list_page(&self, offset: Option<&str>) -> Result<TargetPage, StoreError> {
        let _permit = self.gate.admit().await;

        let mut request = self
            .client
            .get(self.table_url.clone())
            .query(&[("pageSize", self.page_size.to_string())]);
        if let Some(offset) = offset {
            request = request.query(&[("offset", offset)]);
        }

        let response = Self::check(self.authorize(request).send().await?, "list").await?;
        let body: ListResponse = response.json().await?;
        debug!(rows = body.records.len(), more = body.offset.is_some(), "listed target page");

        Ok(TargetPage {
            rows: body
                .records
                .into_iter()
                .map(|record| TargetRow {
                    id: TargetRecordId::new(record.id),
                    fields: record.fields,
                })
                .collect(),
            next_offset: body.offset,
        })
    }

    async fn create_batch(
        &self,
        payloads: &[TargetPayload],
    ) -> Result<Vec<TargetRecordId>, StoreError> {
        let _permit = self.gate.admit().await;

        let request = self.client.post(self.table_url.clone()).json(&CreateRequest {
            records: payloads
                .iter()
                .map(|fields| CreateRecord { fields })
                .collect(),
        });

        let response = Self::check(self.authorize(request).send().await?, "create").await?;
        let body: CreateResponse = response.json().await?;
        if body.records.len() != payloads.len() {
            warn!(
                sent = payloads.len(),
                created = body.records.len(),
                "table service created a different number of rows than submitted"
            );
        }

        Ok(body
            .records
            .into_iter()
            .map(|record| TargetRecordId::new(record.id))
            .collect())
    }

    async fn delete_batch(&self, ids: &[TargetRecordId]) -> Result<usize, StoreError> {
        let _permit = self.gate.admit().await;

        let query: Vec<(&str, &str)> = ids.iter().map(|id| ("records[]", id.as_str())).collect();
        let request = self.client.delete(self.table_url.clone()).query(&query);

        let response = Self::check(self.authorize(request).send().await?, "delete").await?;
        let body: DeleteResponse = response.json().await?;
        Ok(body.records.iter().filter(|record| record.deleted).count())
    }
}

const LIST_SINCE_SQL: &str = "SELECT id, name, category, address, city, region, postal_code, \
     hours, phone, website, wheelchair_accessible, accepts_cards, rating \
     FROM businesses \
     WHERE lower(btrim(name)) > $1 \
     ORDER BY lower(btrim(name)) \
     LIMIT $2";

/// Keyset-paginated reader over the directory's relational dataset.
pub struct PgSourceReader {
    pool: PgPool,
}

impl PgSourceReader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SourceReader for PgSourceReader {
    async fn list_since(
        &self,
        cursor: Option<&NaturalKey>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let cursor_key = cursor.map(NaturalKey::as_str).unwrap_or("");
        let rows = sqlx::query(LIST_SINCE_SQL)
            .bind(cursor_key)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::Source(format!("listing businesses: {err}")))?;

        rows.iter()
            .map(|row| {
                Ok(SourceRecord {
                    id: row
                        .try_get("id")
                        .map_err(|err| StoreError::Source(format!("reading id: {err}")))?,
                    name: row
                        .try_get("name")
                        .map_err(|err| StoreError::Source(format!("reading name: {err}")))?,
                    category: row
                        .try_get("category")
                        .map_err(|err| StoreError::Source(format!("reading category: {err}")))?,
                    address: row.try_get("address").unwrap_or_default(),
                    city: row.try_get("city").unwrap_or_default(),
                    region: row.try_get("region").unwrap_or_default(),
                    postal_code: row.try_get("postal_code").unwrap_or_default(),
                    hours: row.try_get("hours").unwrap_or_default(),
                    phone: row.try_get("phone").unwrap_or_default(),
                    website: row.try_get("website").unwrap_or_default(),
                    wheelchair_accessible: row.try_get("wheelchair_accessible").unwrap_or_default(),
                    accepts_cards: row.try_get("accepts_cards").unwrap_or_default(),
                    rating: row.try_get("rating").unwrap_or_default(),
                })
            })
            .collect()
    }
}

const CHECKPOINT_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS sync_checkpoint (\
     slot TEXT PRIMARY KEY, \
     last_key TEXT, \
     updated_at TIMESTAMPTZ NOT NULL)";

const CHECKPOINT_LOAD_SQL: &str =
    "SELECT last_key, updated_at FROM sync_checkpoint WHERE slot = $1";

const CHECKPOINT_SAVE_SQL: &str = "INSERT INTO sync_checkpoint (slot, last_key, updated_at) \
     VALUES ($1, $2, $3) \
     ON CONFLICT (slot) DO UPDATE \
     SET last_key = EXCLUDED.last_key, updated_at = EXCLUDED.updated_at \
     WHERE sync_checkpoint.last_key IS NULL \
        OR sync_checkpoint.last_key <= EXCLUDED.last_key";

/// Control-table checkpoint. The upsert refuses to move backwards, so
/// the cursor stays monotonic even if two runs race.
pub struct PgCheckpointStore {
    pool: PgPool,
    slot: String,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool, slot: impl Into<String>) -> Self {
        Self {
            pool,
            slot: slot.into(),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CHECKPOINT_TABLE_SQL)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Checkpoint(format!("creating control table: {err}")))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self) -> Result<SyncCheckpoint, StoreError> {
        let row = sqlx::query(CHECKPOINT_LOAD_SQL)
            .bind(&self.slot)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::Checkpoint(format!("loading checkpoint: {err}")))?;

        match row {
            Some(row) => {
                let last_key: Option<String> = row
                    .try_get("last_key")
                    .map_err(|err| StoreError::Checkpoint(format!("reading last_key: {err}")))?;
                let run_timestamp = row
                    .try_get("updated_at")
                    .map_err(|err| StoreError::Checkpoint(format!("reading updated_at: {err}")))?;
                Ok(SyncCheckpoint {
                    last_processed_key: last_key.as_deref().and_then(NaturalKey::normalize),
                    run_timestamp,
                })
            }
            None => Ok(SyncCheckpoint::empty()),
        }
    }

    async fn save(&self, key: &NaturalKey) -> Result<(), StoreError> {
        sqlx::query(CHECKPOINT_SAVE_SQL)
            .bind(&self.slot)
            .bind(key.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Checkpoint(format!("saving checkpoint: {err}")))?;
        Ok(())
    }
}

/// Fixture-backed source for dry runs and tests. Records sort and filter
/// exactly like the relational reader.
pub struct FixtureSourceReader {
    records: Vec<SourceRecord>,
}

impl FixtureSourceReader {
    pub fn new(mut records: Vec<SourceRecord>) -> Self {
        let before = records.len();
        records.retain(|record| record.natural_key().is_some());
        if records.len() < before {
            warn!(
                dropped = before - records.len(),
                "fixture records without a usable name were dropped"
            );
        }
        records.sort_by_key(|record| record.natural_key());
        Self { records }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<SourceRecord> =
            serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SourceReader for FixtureSourceReader {
    async fn list_since(
        &self,
        cursor: Option<&NaturalKey>,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        Ok(self
            .records
            .iter()
            .filter(|record| match (record.natural_key(), cursor) {
                (Some(key), Some(cursor)) => key > *cursor,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .take(limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<TargetRow>,
    next_id: u64,
}

/// In-process table service used by dry runs and tests. Ids are assigned
/// in insertion order, so the earliest row also sorts first.
#[derive(Debug)]
pub struct MemoryTableStore {
    state: StdMutex<MemoryState>,
    page_size: usize,
}

impl Default for MemoryTableStore {
    fn default() -> Self {
        Self::with_page_size(100)
    }
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: StdMutex::new(MemoryState::default()),
            page_size: page_size.max(1),
        }
    }

    /// Inserts a row directly, bypassing the engine. Test seeding only.
    pub fn seed_row(&self, fields: BTreeMap<String, JsonValue>) -> TargetRecordId {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        state.next_id += 1;
        let id = TargetRecordId::new(format!("row{:06}", state.next_id));
        state.rows.push(TargetRow {
            id: id.clone(),
            fields,
        });
        id
    }

    pub fn snapshot(&self) -> Vec<TargetRow> {
        self.state
            .lock()
            .expect("memory store lock poisoned")
            .rows
            .clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().expect("memory store lock poisoned").rows.len()
    }
}

#[async_trait]
impl TargetStore for MemoryTableStore {
    async fn list_page(&self, offset: Option<&str>) -> Result<TargetPage, StoreError> {
        let state = self.state.lock().expect("memory store lock poisoned");
        let start = match offset {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| StoreError::Config(format!("bad continuation token {token}")))?,
            None => 0,
        };
        let end = (start + self.page_size).min(state.rows.len());
        let rows = state.rows[start..end].to_vec();
        let next_offset = (end < state.rows.len()).then(|| end.to_string());
        Ok(TargetPage { rows, next_offset })
    }

    async fn create_batch(
        &self,
        payloads: &[TargetPayload],
    ) -> Result<Vec<TargetRecordId>, StoreError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            state.next_id += 1;
            let id = TargetRecordId::new(format!("row{:06}", state.next_id));
            state.rows.push(TargetRow {
                id: id.clone(),
                fields: payload.fields().clone(),
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn delete_batch(&self, ids: &[TargetRecordId]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().expect("memory store lock poisoned");
        let before = state.rows.len();
        state.rows.retain(|row| !ids.contains(&row.id));
        Ok(before - state.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(name: &str) -> SourceRecord {
        SourceRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            category: "retail".to_string(),
            address: None,
            city: None,
            region: None,
            postal_code: None,
            hours: None,
            phone: None,
            website: None,
            wheelchair_accessible: None,
            accepts_cards: None,
            rating: None,
        }
    }

    #[tokio::test]
    async fn fixture_reader_sorts_and_filters_past_the_cursor() {
        let reader = FixtureSourceReader::new(vec![
            record("Delta Diner"),
            record("  acme Widgets "),
            record("Corner Cafe"),
            record("   "),
        ]);
        assert_eq!(reader.len(), 3);

        let all = reader.list_since(None, 10).await.unwrap();
        let keys: Vec<_> = all
            .iter()
            .map(|r| r.natural_key().unwrap().as_str().to_string())
            .collect();
        assert_eq!(keys, vec!["acme widgets", "corner cafe", "delta diner"]);

        let cursor = NaturalKey::normalize("Corner Cafe").unwrap();
        let after = reader.list_since(Some(&cursor), 10).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].name, "Delta Diner");
    }

    #[tokio::test]
    async fn fixture_reader_respects_the_limit() {
        let reader = FixtureSourceReader::new(vec![
            record("Acme Widgets"),
            record("Bolt Depot"),
            record("Corner Cafe"),
        ]);
        let page = reader.list_since(None, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[1].name, "Bolt Depot");
    }

    #[tokio::test]
    async fn memory_store_pages_with_continuation_tokens() {
        let store = MemoryTableStore::with_page_size(2);
        let mut payload = TargetPayload::new();
        payload.set_string("Name", "One");
        store.create_batch(&[payload.clone(), payload.clone(), payload]).await.unwrap();

        let first = store.list_page(None).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        let token = first.next_offset.expect("more pages");

        let second = store.list_page(Some(&token)).await.unwrap();
        assert_eq!(second.rows.len(), 1);
        assert!(second.next_offset.is_none());
    }

    #[tokio::test]
    async fn memory_store_assigns_ids_in_insertion_order() {
        let store = MemoryTableStore::new();
        let mut payload = TargetPayload::new();
        payload.set_string("Name", "One");
        let ids = store.create_batch(&[payload.clone(), payload]).await.unwrap();
        assert!(ids[0] < ids[1]);

        let deleted = store.delete_batch(&[ids[0].clone()]).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.row_count(), 1);
    }

    #[test]
    fn list_response_parses_the_service_wire_shape() {
        let body = r#"{
            "records": [
                {"id": "rec0042", "fields": {"Name": "Corner Cafe", "Rating": 4.5}},
                {"id": "rec0043"}
            ],
            "offset": "itr9000"
        }"#;
        let parsed: ListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].id, "rec0042");
        assert!(parsed.records[1].fields.is_empty());
        assert_eq!(parsed.offset.as_deref(), Some("itr9000"));
    }

    #[test]
    fn create_request_serializes_fields_per_record() {
        let mut payload = TargetPayload::new();
        payload.set_string("Name", "Corner Cafe");
        payload.set_bool("Accepts Cards", true);
        let request = CreateRequest {
            records: vec![CreateRecord { fields: &payload }],
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json["records"][0]["fields"]["Name"],
            JsonValue::String("Corner Cafe".into())
        );
        assert_eq!(json["records"][0]["fields"]["Accepts Cards"], JsonValue::Bool(true));
    }

    #[test]
    fn retry_after_header_parses_as_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RETRY_AFTER, " 12 ".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(12));

        let mut dated = reqwest::header::HeaderMap::new();
        dated.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(parse_retry_after(&dated), None);
    }
}
