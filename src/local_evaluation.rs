use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use reqwest::header::{ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::Config;
use crate::event::Properties;
use crate::feature_flags::{
    lookup_payload, match_flag_conditions, FeatureFlag, FlagError, FlagResult, MatchContext,
    PropertyGroup,
};
use crate::Error;

/// Response from the local-evaluation definitions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalEvaluationResponse {
    pub flags: Vec<FeatureFlag>,
    /// Group-type index → group-type name.
    #[serde(default)]
    pub group_type_mapping: HashMap<String, String>,
    /// Cohort id → property group.
    #[serde(default)]
    pub cohorts: HashMap<String, PropertyGroup>,
}

#[derive(Debug, Default)]
struct CacheState {
    flags: HashMap<String, FeatureFlag>,
    cohorts: HashMap<String, PropertyGroup>,
    group_type_mapping: HashMap<String, String>,
    loaded: bool,
}

/// Thread-safe cache of flag and cohort definitions.
///
/// The poller is the sole writer, the evaluator the sole reader.
/// Updates replace the whole state in one store, so readers never see
/// a partially applied definition set.
#[derive(Clone, Default)]
pub struct FlagCache {
    state: Arc<RwLock<CacheState>>,
}

impl FlagCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, response: LocalEvaluationResponse) {
        let flag_count = response.flags.len();
        // Build the replacement outside the critical section.
        let mut flags = HashMap::with_capacity(flag_count);
        for flag in response.flags {
            flags.insert(flag.key.clone(), flag);
        }
        let new_state = CacheState {
            flags,
            cohorts: response.cohorts,
            group_type_mapping: response.group_type_mapping,
            loaded: true,
        };

        *self.state.write().unwrap() = new_state;
        debug!(flag_count, "updated flag definition cache");
    }

    /// Whether a definition set has ever been stored.
    pub fn is_loaded(&self) -> bool {
        self.state.read().unwrap().loaded
    }

    pub fn flag_keys(&self) -> Vec<String> {
        self.state.read().unwrap().flags.keys().cloned().collect()
    }

    pub fn clear(&self) {
        *self.state.write().unwrap() = CacheState::default();
    }
}

/// Evaluates feature flags from locally cached definitions, without
/// network round-trips.
#[derive(Clone)]
pub struct LocalEvaluator {
    cache: FlagCache,
}

impl LocalEvaluator {
    pub fn new(cache: FlagCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &FlagCache {
        &self.cache
    }

    /// Decide one flag for a subject.
    ///
    /// Group-targeted flags swap the hashing subject and property bag
    /// for the matching group's. Errors are recoverable: inconclusive
    /// results and server-only definitions send the caller to remote
    /// evaluation.
    #[instrument(skip(self, person_properties, group_properties), level = "trace")]
    pub fn evaluate(
        &self,
        key: &str,
        distinct_id: &str,
        groups: &HashMap<String, String>,
        person_properties: &Properties,
        group_properties: &HashMap<String, Properties>,
    ) -> Result<FlagResult, FlagError> {
        let state = self.cache.state.read().unwrap();

        let flag = state
            .flags
            .get(key)
            .ok_or_else(|| FlagError::inconclusive(&format!("flag '{key}' not cached")))?;

        if !flag.active {
            return Ok(FlagResult {
                value: Some(crate::FlagValue::Boolean(false)),
                reason: Some("flag is inactive".to_string()),
                flag_id: flag.id,
                flag_version: flag.version,
                payload: lookup_payload(flag, &crate::FlagValue::Boolean(false)),
                locally_evaluated: true,
                ..Default::default()
            });
        }

        if flag.ensure_experience_continuity {
            return Err(FlagError::RequiresServerEvaluation);
        }

        let empty_bag = Properties::new();
        let (subject, bag): (&str, &Properties) =
            match flag.filters.aggregation_group_type_index {
                Some(index) => {
                    let group_type = state
                        .group_type_mapping
                        .get(&index.to_string())
                        .ok_or_else(|| {
                            FlagError::inconclusive(&format!(
                                "no group type mapping for index {index}"
                            ))
                        })?;
                    let group_key = groups.get(group_type).ok_or_else(|| {
                        FlagError::inconclusive(&format!(
                            "no group key provided for group type '{group_type}'"
                        ))
                    })?;
                    let bag = group_properties.get(group_type).unwrap_or(&empty_bag);
                    (group_key.as_str(), bag)
                }
                None => (distinct_id, person_properties),
            };

        let ctx = MatchContext::new(&state.flags, &state.cohorts, subject, bag);
        let value = match_flag_conditions(flag, &ctx)?;
        trace!(key, %value, "flag evaluated locally");

        Ok(FlagResult {
            payload: lookup_payload(flag, &value),
            value: Some(value),
            reason: None,
            flag_id: flag.id,
            flag_version: flag.version,
            locally_evaluated: true,
            ..Default::default()
        })
    }

    /// Evaluate every cached flag. Returns the per-flag results plus
    /// whether any flag could not be decided locally, in which case
    /// the caller should prefer one remote fetch.
    #[instrument(skip(self, person_properties, group_properties), level = "debug")]
    pub fn evaluate_all(
        &self,
        distinct_id: &str,
        groups: &HashMap<String, String>,
        person_properties: &Properties,
        group_properties: &HashMap<String, Properties>,
    ) -> (HashMap<String, FlagResult>, bool) {
        let keys = self.cache.flag_keys();
        let mut results = HashMap::with_capacity(keys.len());
        let mut fallback_needed = false;

        for key in keys {
            match self.evaluate(&key, distinct_id, groups, person_properties, group_properties) {
                Ok(result) => {
                    results.insert(key, result);
                }
                Err(e) => {
                    trace!(key, error = %e, "flag not locally decidable");
                    fallback_needed = true;
                }
            }
        }

        debug!(
            flag_count = results.len(),
            fallback_needed, "evaluated all local flags"
        );
        (results, fallback_needed)
    }
}

/// Background poller for flag and cohort definitions.
///
/// Fetches the definition set on `start` (so immediately following
/// queries see cached data), then refreshes on an interval until
/// stopped. Conditional requests ride on the stored ETag.
pub struct FlagPoller {
    config: Arc<Config>,
    cache: FlagCache,
    client: reqwest::Client,
    etag: Arc<Mutex<Option<String>>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl FlagPoller {
    pub fn new(config: Arc<Config>, cache: FlagCache) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.feature_flag_request_timeout)
            .danger_accept_invalid_certs(config.skip_tls_verification)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            config,
            cache,
            client,
            etag: Arc::new(Mutex::new(None)),
            stop_tx,
            stop_rx,
            task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Fetch once, then spawn the polling task. Idempotent.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("flag poller already running, skipping start");
            return;
        }

        info!(
            poll_interval_secs = self.config.feature_flag_poll_interval.as_secs(),
            "starting feature flag poller"
        );

        // Initial load happens before start returns so that flag
        // queries issued right after construction hit the cache.
        self.poll_once().await;

        let config = self.config.clone();
        let cache = self.cache.clone();
        let client = self.client.clone();
        let etag = self.etag.clone();
        let running = self.running.clone();
        let mut stop_rx = self.stop_rx.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.feature_flag_poll_interval);
            interval.tick().await; // skip the immediate first tick

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        fetch_definitions(&client, &config, &cache, &etag).await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("flag poller received stop signal");
                            break;
                        }
                    }
                }
            }

            running.store(false, Ordering::SeqCst);
        });

        *self.task.lock().unwrap() = Some(task);
    }

    /// One fetch cycle; used by the poll loop and manual reloads.
    pub async fn poll_once(&self) {
        fetch_definitions(&self.client, &self.config, &self.cache, &self.etag).await;
    }

    /// Stop the poller and wait for the task to exit.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for FlagPoller {
    fn drop(&mut self) {
        // Abort the task if the owner never called stop.
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

/// Fetch the definition set and replace the cache on a 200. Failures
/// skip the cycle; the cache keeps serving the previous definitions.
async fn fetch_definitions(
    client: &reqwest::Client,
    config: &Config,
    cache: &FlagCache,
    etag: &Mutex<Option<String>>,
) {
    let personal_api_key = match &config.personal_api_key {
        Some(key) => key.clone(),
        None => return,
    };
    let url = config.endpoints.local_evaluation_url(&config.api_key);

    let mut request = client
        .get(&url)
        .header(AUTHORIZATION, format!("Bearer {personal_api_key}"))
        .header(ACCEPT, "application/json");
    let known_etag = etag.lock().unwrap().clone();
    if let Some(tag) = known_etag {
        request = request.header(IF_NONE_MATCH, tag);
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            config.report_error(-1, &format!("failed to fetch flag definitions: {e}"));
            return;
        }
    };

    let status = response.status().as_u16();
    match status {
        200 => {
            let new_etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            match response.json::<LocalEvaluationResponse>().await {
                Ok(definitions) => {
                    cache.update(definitions);
                    *etag.lock().unwrap() = new_etag;
                }
                Err(e) => {
                    config.report_error(-1, &format!("failed to parse flag definitions: {e}"));
                }
            }
        }
        304 => {
            trace!("flag definitions unchanged");
        }
        401 | 403 => {
            config.report_error(
                i32::from(status),
                "personal API key rejected while fetching flag definitions",
            );
        }
        402 => {
            config.report_error(
                402,
                "feature flags quota limited, skipping definition refresh",
            );
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            warn!(status, "unexpected response fetching flag definitions");
            config.report_error(
                i32::from(status),
                &format!("failed to fetch flag definitions: HTTP {status}: {body}"),
            );
        }
    }
}
