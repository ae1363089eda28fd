//! Delta Sharing REST client reading table versions, change data and snapshots.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use giga_core::ChangeType;
use giga_storage::{FetchRequest, FetchedResponse, HttpFetcher};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::parquet_rows::decode_parquet;
use crate::{
    read_json_file, ChangeFeedSource, ChangeRecord, FeedError, ImpliedMeta, TableRef,
};

const VERSION_HEADER: &str = "delta-table-version";
const SUPPORTED_CREDENTIALS_VERSION: u32 = 1;

/// Share profile file handed out by the data provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaSharingProfile {
    pub share_credentials_version: u32,
    pub endpoint: String,
    pub bearer_token: String,
    #[serde(default)]
    pub expiration_time: Option<DateTime<Utc>>,
}

impl DeltaSharingProfile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let profile: Self = read_json_file(path)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let profile: Self = serde_json::from_str(raw)?;
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if self.share_credentials_version > SUPPORTED_CREDENTIALS_VERSION {
            bail!(
                "share credentials version {} is newer than supported version {}",
                self.share_credentials_version,
                SUPPORTED_CREDENTIALS_VERSION
            );
        }
        if self.endpoint.trim().is_empty() {
            bail!("profile endpoint is empty");
        }
        if self.bearer_token.trim().is_empty() {
            bail!("profile bearer token is empty");
        }
        Ok(())
    }

    pub fn ensure_valid(&self, now: DateTime<Utc>) -> Result<(), FeedError> {
        match self.expiration_time {
            Some(expires) if expires <= now => Err(FeedError::CredentialsExpired(expires)),
            _ => Ok(()),
        }
    }
}

/// Which response line a file came from. Decides the change type of rows that do not
/// carry their own `_change_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Snapshot,
    Add,
    Cdf,
    Remove,
}

impl FileKind {
    fn implied_change_type(self) -> Option<ChangeType> {
        match self {
            Self::Snapshot | Self::Add => Some(ChangeType::Insert),
            Self::Remove => Some(ChangeType::Delete),
            Self::Cdf => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAction {
    pub url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub partition_values: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub size: Option<i64>,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct ActionLine {
    file: Option<FileAction>,
    add: Option<FileAction>,
    cdf: Option<FileAction>,
    remove: Option<FileAction>,
}

/// Parses a newline-delimited response body, keeping only the file-bearing lines.
/// `protocol` and `metaData` lines are skipped.
pub fn parse_actions(body: &str) -> Result<Vec<(FileKind, FileAction)>, FeedError> {
    let mut actions = Vec::new();
    for (line_no, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: ActionLine = serde_json::from_str(line)
            .map_err(|err| FeedError::Protocol(format!("line {}: {err}", line_no + 1)))?;
        let entry = [
            (FileKind::Snapshot, parsed.file),
            (FileKind::Add, parsed.add),
            (FileKind::Cdf, parsed.cdf),
            (FileKind::Remove, parsed.remove),
        ]
        .into_iter()
        .find_map(|(kind, action)| action.map(|a| (kind, a)));
        if let Some(entry) = entry {
            actions.push(entry);
        }
    }
    Ok(actions)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTablesPage {
    #[serde(default)]
    items: Vec<ListedTable>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedTable {
    name: String,
}

pub struct DeltaSharingClient {
    http: HttpFetcher,
    profile: DeltaSharingProfile,
    share: String,
    schema: String,
}

impl DeltaSharingClient {
    pub fn new(
        http: HttpFetcher,
        profile: DeltaSharingProfile,
        share: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            http,
            profile,
            share: share.into(),
            schema: schema.into(),
        }
    }

    fn schema_url(&self) -> String {
        format!(
            "{}/shares/{}/schemas/{}",
            self.profile.endpoint.trim_end_matches('/'),
            self.share,
            self.schema
        )
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!("{}/tables/{}", self.schema_url(), table.name)
    }

    async fn authed(&self, table: &str, request: FetchRequest<'_>) -> Result<FetchedResponse, FeedError> {
        self.profile.ensure_valid(Utc::now())?;
        Ok(self
            .http
            .send(table, request.bearer(&self.profile.bearer_token))
            .await?)
    }

    async fn read_files(
        &self,
        table: &TableRef,
        actions: Vec<(FileKind, FileAction)>,
        default_version: Option<i64>,
    ) -> Result<Vec<ChangeRecord>, FeedError> {
        let label = table.to_string();
        let mut records = Vec::new();
        let mut dropped = 0usize;
        for (kind, action) in actions {
            // Presigned file URLs must not receive the share token.
            let response = self.http.send(&label, FetchRequest::get(&action.url)).await?;
            let implied = ImpliedMeta {
                change_type: kind.implied_change_type(),
                version: action.version.or(default_version),
                timestamp_ms: action.timestamp,
            };
            for mut columns in decode_parquet(response.body)? {
                for (name, value) in &action.partition_values {
                    columns
                        .entry(name.clone())
                        .or_insert_with(|| value.clone().map_or(JsonValue::Null, JsonValue::String));
                }
                match ChangeRecord::from_columns(columns, implied)? {
                    Some(record) => records.push(record),
                    None => dropped += 1,
                }
            }
            debug!(table = %label, file = action.id.as_deref().unwrap_or(""), ?kind, "decoded file");
        }
        if dropped > 0 {
            warn!(table = %label, dropped, "dropped rows without a school_id_giga");
        }
        Ok(records)
    }
}

#[async_trait]
impl ChangeFeedSource for DeltaSharingClient {
    fn table_for_iso3(&self, iso3: &str) -> TableRef {
        TableRef::new(&self.share, &self.schema, iso3.trim().to_ascii_lowercase())
    }

    async fn list_tables(&self) -> Result<Vec<TableRef>, FeedError> {
        let base = format!("{}/tables", self.schema_url());
        let mut tables = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = match &page_token {
                Some(token) => format!("{base}?pageToken={token}"),
                None => base.clone(),
            };
            let response = self.authed(&self.schema, FetchRequest::get(&url)).await?;
            let page: ListTablesPage = serde_json::from_slice(&response.body)
                .map_err(|err| FeedError::Protocol(format!("list tables: {err}")))?;
            tables.extend(
                page.items
                    .into_iter()
                    .map(|item| TableRef::new(&self.share, &self.schema, item.name)),
            );
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        info!(share = %self.share, schema = %self.schema, tables = tables.len(), "listed tables");
        Ok(tables)
    }

    async fn current_version(&self, table: &TableRef) -> Result<i64, FeedError> {
        let url = format!("{}/version", self.table_url(table));
        let response = self.authed(&table.to_string(), FetchRequest::get(&url)).await?;
        response
            .header(VERSION_HEADER)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .ok_or_else(|| FeedError::Protocol(format!("{table}: missing {VERSION_HEADER} header")))
    }

    async fn changes(
        &self,
        table: &TableRef,
        from_version: i64,
        to_version: i64,
    ) -> Result<Vec<ChangeRecord>, FeedError> {
        let url = format!(
            "{}/changes?startingVersion={from_version}&endingVersion={to_version}",
            self.table_url(table)
        );
        let response = self.authed(&table.to_string(), FetchRequest::get(&url)).await?;
        let body = String::from_utf8_lossy(&response.body);
        let actions = parse_actions(&body)?;
        info!(table = %table, from_version, to_version, files = actions.len(), "reading change data");
        self.read_files(table, actions, None).await
    }

    async fn snapshot(&self, table: &TableRef, version: i64) -> Result<Vec<ChangeRecord>, FeedError> {
        let url = format!("{}/query", self.table_url(table));
        let body = json!({ "version": version });
        let response = self
            .authed(&table.to_string(), FetchRequest::post_json(&url, &body))
            .await?;
        let text = String::from_utf8_lossy(&response.body);
        let actions = parse_actions(&text)?;
        info!(table = %table, version, files = actions.len(), "reading snapshot");
        self.read_files(table, actions, Some(version)).await
    }
}
