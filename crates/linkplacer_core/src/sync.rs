use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::audit::{self, AuditAction};
use crate::config::ToolConfig;
use crate::rebuild::{RebuildOptions, RebuildReport, rebuild};
use crate::rules::normalize_category_name;
use crate::runtime::ResolvedPaths;
use crate::store;

const NS_MAIN: i32 = 0;

const CONTENT_AREA_PROP: &str = "ArticleContentArea";
const ARTICLE_TYPE_PROP: &str = "ArticleType";
const SNAPSHOT_FILENAME: &str = "last-sync.json";

pub(crate) const LAST_SYNC_META_KEY: &str = "last_sync_unix";
pub(crate) const LAST_SYNC_SOURCE_META_KEY: &str = "last_sync_source";

/// One content page as the wiki reports it. Content area and article type
/// ride in page props; either may be absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemotePageInfo {
    pub page_id: i64,
    pub title: String,
    #[serde(default)]
    pub content_area: Option<String>,
    #[serde(default)]
    pub article_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageCategory {
    pub page_id: i64,
    pub category: String,
}

/// Everything sync mirrors locally. Also the on-disk snapshot format for
/// `sync --from-file`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WikiSnapshot {
    #[serde(default)]
    pub pages: Vec<RemotePageInfo>,
    #[serde(default)]
    pub page_categories: Vec<PageCategory>,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub rebuild: bool,
    pub from_file: Option<PathBuf>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            rebuild: true,
            from_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub requested: usize,
    pub purged: usize,
    pub failed: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub pages_synced: usize,
    pub category_memberships_synced: usize,
    pub category_memberships_skipped: usize,
    pub pages_removed: usize,
    pub request_count: usize,
    pub snapshot_path: Option<String>,
    pub rebuild: Option<RebuildReport>,
    pub purge: Option<PurgeReport>,
}

pub trait WikiApi {
    fn get_content_pages(&mut self) -> Result<Vec<RemotePageInfo>>;
    fn get_page_categories(&mut self, page_ids: &[i64]) -> Result<Vec<PageCategory>>;
    fn purge_pages(&mut self, page_ids: &[i64]) -> Result<usize>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct MediaWikiClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_read_ms: u64,
    pub rate_limit_write_ms: u64,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

impl MediaWikiClientConfig {
    pub fn from_config(config: &ToolConfig) -> Self {
        let api_default = config.wiki.api_url.as_deref().unwrap_or("");
        Self::from_env_with_defaults(api_default, &config.user_agent())
    }

    fn from_env_with_defaults(api_url_default: &str, user_agent_default: &str) -> Self {
        Self {
            api_url: env_value("WIKI_API_URL", api_url_default),
            user_agent: env_value("WIKI_USER_AGENT", user_agent_default),
            timeout_ms: env_value_u64("WIKI_HTTP_TIMEOUT_MS", 30_000),
            rate_limit_read_ms: env_value_u64("WIKI_RATE_LIMIT_READ", 300),
            rate_limit_write_ms: env_value_u64("WIKI_RATE_LIMIT_WRITE", 1_000),
            max_retries: env_value_usize("WIKI_HTTP_RETRIES", 2),
            max_write_retries: env_value_usize("WIKI_HTTP_WRITE_RETRIES", 1),
            retry_delay_ms: env_value_u64("WIKI_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct MediaWikiClient {
    client: Client,
    config: MediaWikiClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl MediaWikiClient {
    pub fn new(config: MediaWikiClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .cookie_store(true)
            .build()
            .context("failed to build MediaWiki HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn request_json_get(&mut self, params: &[(&str, String)]) -> Result<Value> {
        let base_url = Url::parse(&self.config.api_url)
            .with_context(|| format!("invalid WIKI_API_URL: {}", self.config.api_url))?;

        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit(false);
            let response = self
                .client
                .get(base_url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, false);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, false);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn request_json_post(&mut self, params: &[(&str, String)], is_write: bool) -> Result<Value> {
        let max_retries = if is_write {
            self.config.max_write_retries
        } else {
            self.config.max_retries
        };
        let mut pairs = Vec::with_capacity(params.len() + 2);
        pairs.push(("format".to_string(), "json".to_string()));
        pairs.push(("formatversion".to_string(), "2".to_string()));
        for (key, value) in params {
            if !value.is_empty() {
                pairs.push(((*key).to_string(), value.clone()));
            }
        }

        for attempt in 0..=max_retries {
            self.apply_rate_limit(is_write);
            let response = self
                .client
                .post(&self.config.api_url)
                .header("User-Agent", self.config.user_agent.clone())
                .form(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt, is_write);
                            continue;
                        }
                        bail!("MediaWiki API request failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode MediaWiki API JSON response")?;
                    if let Some(error) = payload.get("error") {
                        let code = error
                            .get("code")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown_error");
                        let info = error
                            .get("info")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown info");
                        bail!("MediaWiki API error [{code}]: {info}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt, is_write);
                        continue;
                    }
                    return Err(error).context("failed to call MediaWiki API");
                }
            }
        }

        bail!("MediaWiki API request exhausted retry budget")
    }

    fn apply_rate_limit(&mut self, is_write: bool) {
        let delay = if is_write {
            Duration::from_millis(self.config.rate_limit_write_ms)
        } else {
            Duration::from_millis(self.config.rate_limit_read_ms)
        };
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize, is_write: bool) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        let multiplier = if is_write { 2u64 } else { 1u64 };
        sleep(Duration::from_millis(
            base.saturating_mul(multiplier).saturating_add(jitter),
        ));
    }
}

impl WikiApi for MediaWikiClient {
    fn get_content_pages(&mut self) -> Result<Vec<RemotePageInfo>> {
        let mut pages = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = vec![
                ("action", "query".to_string()),
                ("generator", "allpages".to_string()),
                ("gapnamespace", NS_MAIN.to_string()),
                ("gaplimit", "500".to_string()),
                ("prop", "pageprops".to_string()),
                ("ppprop", format!("{CONTENT_AREA_PROP}|{ARTICLE_TYPE_PROP}")),
            ];
            if let Some(token) = &continue_token {
                params.push(("gapcontinue", token.clone()));
            }

            let response = self.request_json_get(&params)?;
            let parsed: QueryResponse = serde_json::from_value(response)
                .context("failed to decode allpages API response")?;

            for page in parsed.query.pages {
                if page.missing.unwrap_or(false) {
                    continue;
                }
                let Some(page_id) = page.pageid else {
                    continue;
                };
                let props = page.pageprops.unwrap_or_default();
                pages.push(RemotePageInfo {
                    page_id,
                    title: page.title,
                    content_area: props.content_area,
                    article_type: props.article_type,
                });
            }

            continue_token = parsed.continuation.and_then(|cont| cont.gapcontinue);
            if continue_token.is_none() {
                break;
            }
        }

        Ok(pages)
    }

    fn get_page_categories(&mut self, page_ids: &[i64]) -> Result<Vec<PageCategory>> {
        let mut memberships = Vec::new();

        for batch in page_ids.chunks(50) {
            let ids = batch
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            let mut continue_token: Option<String> = None;

            loop {
                let mut params = vec![
                    ("action", "query".to_string()),
                    ("pageids", ids.clone()),
                    ("prop", "categories".to_string()),
                    ("cllimit", "500".to_string()),
                ];
                if let Some(token) = &continue_token {
                    params.push(("clcontinue", token.clone()));
                }

                let response = self.request_json_get(&params)?;
                let parsed: QueryResponse = serde_json::from_value(response)
                    .context("failed to decode categories API response")?;

                for page in parsed.query.pages {
                    let Some(page_id) = page.pageid else {
                        continue;
                    };
                    for category in page.categories {
                        let title = category
                            .title
                            .strip_prefix("Category:")
                            .unwrap_or(&category.title);
                        memberships.push(PageCategory {
                            page_id,
                            category: title.to_string(),
                        });
                    }
                }

                continue_token = parsed.continuation.and_then(|cont| cont.clcontinue);
                if continue_token.is_none() {
                    break;
                }
            }
        }

        Ok(memberships)
    }

    fn purge_pages(&mut self, page_ids: &[i64]) -> Result<usize> {
        let mut purged = 0usize;
        for batch in page_ids.chunks(50) {
            let ids = batch
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("|");
            let response = self
                .request_json_post(&[("action", "purge".to_string()), ("pageids", ids)], true)?;
            let parsed: PurgeResponse =
                serde_json::from_value(response).context("failed to decode purge response")?;
            purged += parsed
                .purge
                .iter()
                .filter(|item| item.purged.unwrap_or(false))
                .count();
        }
        Ok(purged)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Refresh the local mirror, then (unless disabled) re-derive assignments
/// and ask the wiki to purge every affected page. With `from_file` set the
/// records come from a JSON snapshot instead of the API and no purge runs.
pub fn sync(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    options: &SyncOptions,
) -> Result<SyncReport> {
    if let Some(snapshot_path) = &options.from_file {
        let snapshot = load_snapshot(snapshot_path)?;
        let source = normalize_path_string(snapshot_path);
        let mut report = replace_mirror(paths, &snapshot, &source)?;
        if options.rebuild {
            report.rebuild = Some(rebuild(paths, config, &RebuildOptions::default())?);
        }
        return Ok(report);
    }

    let client_config = MediaWikiClientConfig::from_config(config);
    if client_config.api_url.is_empty() {
        bail!(
            "no wiki API URL configured.\nSet [wiki] api_url in config.toml or export WIKI_API_URL, or import offline state with `linkplacer sync --from-file <json>`."
        );
    }
    let mut client = MediaWikiClient::new(client_config)?;
    sync_with_api(paths, config, options, &mut client)
}

pub fn sync_with_api<A: WikiApi>(
    paths: &ResolvedPaths,
    config: &ToolConfig,
    options: &SyncOptions,
    api: &mut A,
) -> Result<SyncReport> {
    let pages = api.get_content_pages()?;
    let page_ids: Vec<i64> = pages.iter().map(|page| page.page_id).collect();
    let page_categories = api.get_page_categories(&page_ids)?;

    let snapshot = WikiSnapshot {
        pages,
        page_categories,
    };
    let mut report = replace_mirror(paths, &snapshot, "remote")?;
    let snapshot_path = write_snapshot(paths, &snapshot)?;
    report.snapshot_path = Some(normalize_path_string(&snapshot_path));

    if options.rebuild {
        let rebuild_report = rebuild(paths, config, &RebuildOptions::default())?;
        report.purge = Some(purge_with_api(api, &rebuild_report.affected_page_ids));
        report.rebuild = Some(rebuild_report);
    }

    report.request_count = api.request_count();
    Ok(report)
}

/// Purge notification is advisory: failure lands in the report, never in
/// the Result, so a flaky wiki cannot roll back a finished rebuild.
pub fn purge_with_api<A: WikiApi>(api: &mut A, page_ids: &[i64]) -> PurgeReport {
    if page_ids.is_empty() {
        return PurgeReport {
            requested: 0,
            purged: 0,
            failed: false,
            detail: None,
        };
    }
    match api.purge_pages(page_ids) {
        Ok(purged) => PurgeReport {
            requested: page_ids.len(),
            purged,
            failed: false,
            detail: None,
        },
        Err(error) => PurgeReport {
            requested: page_ids.len(),
            purged: 0,
            failed: true,
            detail: Some(format!("{error:#}")),
        },
    }
}

/// Purge through a client built from config. Used by the standalone rebuild
/// path; an unconfigured API URL skips the purge instead of failing it.
pub fn purge_wiki_pages(config: &ToolConfig, page_ids: &[i64]) -> PurgeReport {
    if page_ids.is_empty() {
        return PurgeReport {
            requested: 0,
            purged: 0,
            failed: false,
            detail: None,
        };
    }
    let client_config = MediaWikiClientConfig::from_config(config);
    if client_config.api_url.is_empty() {
        return PurgeReport {
            requested: page_ids.len(),
            purged: 0,
            failed: false,
            detail: Some("no wiki API URL configured; purge skipped".to_string()),
        };
    }
    match MediaWikiClient::new(client_config) {
        Ok(mut client) => purge_with_api(&mut client, page_ids),
        Err(error) => PurgeReport {
            requested: page_ids.len(),
            purged: 0,
            failed: true,
            detail: Some(format!("{error:#}")),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastSyncInfo {
    pub synced_at_unix: i64,
    pub source: Option<String>,
}

/// Timestamp and source of the most recent mirror refresh, if any.
pub fn last_sync_info(paths: &ResolvedPaths) -> Result<Option<LastSyncInfo>> {
    let connection = store::open_connection(&paths.db_path)?;
    let Some(synced_at) = store::meta_get(&connection, LAST_SYNC_META_KEY)? else {
        return Ok(None);
    };
    let synced_at_unix = synced_at
        .parse::<i64>()
        .with_context(|| format!("corrupt {LAST_SYNC_META_KEY} meta value: {synced_at}"))?;
    let source = store::meta_get(&connection, LAST_SYNC_SOURCE_META_KEY)?;
    Ok(Some(LastSyncInfo {
        synced_at_unix,
        source,
    }))
}

fn replace_mirror(
    paths: &ResolvedPaths,
    snapshot: &WikiSnapshot,
    source: &str,
) -> Result<SyncReport> {
    let mut connection = store::open_connection(&paths.db_path)?;

    let mut old_pages = HashSet::new();
    {
        let mut statement = connection
            .prepare("SELECT page_id FROM pages")
            .context("failed to prepare mirrored pages query")?;
        let rows = statement
            .query_map([], |row| row.get::<_, i64>(0))
            .context("failed to run mirrored pages query")?;
        for row in rows {
            old_pages.insert(row.context("failed to decode mirrored page id")?);
        }
    }

    let transaction = connection
        .transaction()
        .context("failed to start mirror replace transaction")?;
    transaction
        .execute("DELETE FROM page_categories", [])
        .context("failed to clear page_categories table")?;
    transaction
        .execute("DELETE FROM pages", [])
        .context("failed to clear pages table")?;

    let mut page_statement = transaction
        .prepare(
            "INSERT INTO pages (page_id, title, content_area, article_type)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .context("failed to prepare pages insert")?;
    let mut new_pages = HashSet::new();
    for page in &snapshot.pages {
        let title = page.title.trim().replace('_', " ");
        if title.is_empty() {
            bail!("page {} has an empty title", page.page_id);
        }
        page_statement
            .execute(params![
                page.page_id,
                title,
                page.content_area,
                page.article_type
            ])
            .with_context(|| format!("failed to insert page {}", page.page_id))?;
        new_pages.insert(page.page_id);
    }
    drop(page_statement);

    let mut membership_statement = transaction
        .prepare("INSERT OR IGNORE INTO page_categories (page_id, category) VALUES (?1, ?2)")
        .context("failed to prepare page_categories insert")?;
    let mut memberships_synced = 0usize;
    let mut memberships_skipped = 0usize;
    for membership in &snapshot.page_categories {
        if !new_pages.contains(&membership.page_id) {
            memberships_skipped += 1;
            continue;
        }
        let Some(category) = normalize_category_name(&membership.category) else {
            memberships_skipped += 1;
            continue;
        };
        let affected = membership_statement
            .execute(params![membership.page_id, category])
            .with_context(|| {
                format!(
                    "failed to insert category membership for page {}",
                    membership.page_id
                )
            })?;
        memberships_synced += affected;
    }
    drop(membership_statement);

    let now =
        i64::try_from(store::unix_timestamp()?).context("timestamp does not fit into i64")?;
    store::meta_set(&transaction, LAST_SYNC_META_KEY, &now.to_string())?;
    store::meta_set(&transaction, LAST_SYNC_SOURCE_META_KEY, source)?;
    audit::record(
        &transaction,
        AuditAction::Sync,
        None,
        &json!({
            "source": source,
            "pages": new_pages.len(),
            "memberships": memberships_synced,
        }),
    )?;

    transaction
        .commit()
        .context("failed to commit mirror replace transaction")?;

    Ok(SyncReport {
        source: source.to_string(),
        pages_synced: new_pages.len(),
        category_memberships_synced: memberships_synced,
        category_memberships_skipped: memberships_skipped,
        pages_removed: old_pages.difference(&new_pages).count(),
        request_count: 0,
        snapshot_path: None,
        rebuild: None,
        purge: None,
    })
}

fn load_snapshot(path: &Path) -> Result<WikiSnapshot> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse snapshot {}", path.display()))
}

fn write_snapshot(paths: &ResolvedPaths, snapshot: &WikiSnapshot) -> Result<PathBuf> {
    fs::create_dir_all(&paths.snapshots_dir).with_context(|| {
        format!(
            "failed to create snapshots directory {}",
            paths.snapshots_dir.display()
        )
    })?;
    let path = paths.snapshots_dir.join(SNAPSHOT_FILENAME);
    let payload =
        serde_json::to_string_pretty(snapshot).context("failed to serialize wiki snapshot")?;
    fs::write(&path, payload)
        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
    Ok(path)
}

fn normalize_path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn env_value(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[derive(Debug, Deserialize, Default)]
struct QueryResponse {
    #[serde(default)]
    query: QueryPayload,
    #[serde(default, rename = "continue")]
    continuation: Option<ContinuationPayload>,
}

#[derive(Debug, Deserialize, Default)]
struct QueryPayload {
    #[serde(default)]
    pages: Vec<PageQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    gapcontinue: Option<String>,
    clcontinue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PageQueryItem {
    pageid: Option<i64>,
    title: String,
    missing: Option<bool>,
    #[serde(default)]
    pageprops: Option<PagePropsPayload>,
    #[serde(default)]
    categories: Vec<CategoryQueryItem>,
}

#[derive(Debug, Deserialize, Default)]
struct PagePropsPayload {
    #[serde(rename = "ArticleContentArea")]
    content_area: Option<String>,
    #[serde(rename = "ArticleType")]
    article_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryQueryItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct PurgeResponse {
    #[serde(default)]
    purge: Vec<PurgeItem>,
}

#[derive(Debug, Deserialize)]
struct PurgeItem {
    purged: Option<bool>,
}
