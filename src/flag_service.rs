use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::Config;
use crate::event::Properties;
use crate::feature_flags::{FlagError, FlagResult, FlagValue};
use crate::local_evaluation::{FlagCache, FlagPoller, LocalEvaluator};
use crate::remote_evaluation::RemoteEvaluator;
use crate::Error;

/// Per-query options for flag lookups.
#[derive(Debug, Clone, Default)]
pub struct FlagOptions {
    /// Group memberships of the subject, group-type → group-key.
    pub groups: HashMap<String, String>,
    pub person_properties: Properties,
    /// Property bags per group type, for group-targeted flags.
    pub group_properties: HashMap<String, Properties>,
    /// Never fall back to the remote decide endpoint.
    pub only_evaluate_locally: bool,
}

/// A recorded flag decision, drained into `$feature_flag_called`
/// events on shutdown. Deduplicated per (distinct_id, key, value) over
/// the client's lifetime.
#[derive(Debug, Clone)]
pub struct FlagCallEvent {
    pub distinct_id: String,
    pub key: String,
    pub result: FlagResult,
}

#[derive(Default)]
struct FlagCallLog {
    seen: HashSet<(String, String, String)>,
    pending: Vec<FlagCallEvent>,
}

/// Routes flag queries local-first with remote fallback, and tracks
/// flag-called telemetry.
pub(crate) struct FlagService {
    remote: RemoteEvaluator,
    local: Option<LocalEvaluator>,
    poller: Option<FlagPoller>,
    calls: Mutex<FlagCallLog>,
}

impl FlagService {
    pub fn new(config: Arc<Config>) -> Result<Self, Error> {
        let remote = RemoteEvaluator::new(config.clone())?;

        let (local, poller) = if config.personal_api_key.is_some() {
            let cache = FlagCache::new();
            let poller = FlagPoller::new(config, cache.clone())?;
            (Some(LocalEvaluator::new(cache)), Some(poller))
        } else {
            (None, None)
        };

        Ok(Self {
            remote,
            local,
            poller,
            calls: Mutex::new(FlagCallLog::default()),
        })
    }

    /// Start the definition poller; the first fetch completes before
    /// this returns.
    pub async fn start(&self) {
        if let Some(poller) = &self.poller {
            poller.start().await;
        }
    }

    pub fn local_evaluation_enabled(&self) -> bool {
        self.local.is_some()
    }

    pub async fn reload(&self) {
        if let Some(poller) = &self.poller {
            poller.poll_once().await;
        }
    }

    pub async fn stop(&self) {
        if let Some(poller) = &self.poller {
            poller.stop().await;
        }
    }

    /// Decide one flag for a subject: local evaluation when the cache
    /// can answer, the decide endpoint otherwise. Conclusive decisions
    /// are recorded for flag-called telemetry.
    pub async fn get_flag(
        &self,
        key: &str,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<FlagResult> {
        if let Some(local) = &self.local {
            if local.cache().is_loaded() {
                match local.evaluate(
                    key,
                    distinct_id,
                    &options.groups,
                    &options.person_properties,
                    &options.group_properties,
                ) {
                    Ok(result) => {
                        debug!(key, value = ?result.value, "flag evaluated locally");
                        self.record_call(distinct_id, key, &result);
                        return Some(result);
                    }
                    Err(FlagError::RequiresServerEvaluation) => {
                        debug!(key, "flag requires server evaluation");
                    }
                    Err(FlagError::Inconclusive(e)) => {
                        debug!(key, error = %e.message, "local evaluation inconclusive");
                    }
                }
            }
        }

        if options.only_evaluate_locally {
            return None;
        }

        trace!(key, "fetching flag from decide endpoint");
        let response = self
            .remote
            .fetch(
                distinct_id,
                &options.groups,
                &options.person_properties,
                &options.group_properties,
            )
            .await?;

        let result = response.flags.get(key).cloned()?;
        self.record_call(distinct_id, key, &result);
        Some(result)
    }

    /// Decide every flag for a subject. Local results are used only
    /// when the whole cached set is decidable; otherwise one remote
    /// fetch supplies the map.
    pub async fn get_all_flags(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Option<HashMap<String, FlagResult>> {
        if let Some(local) = &self.local {
            if local.cache().is_loaded() {
                let (results, fallback_needed) = local.evaluate_all(
                    distinct_id,
                    &options.groups,
                    &options.person_properties,
                    &options.group_properties,
                );
                if !fallback_needed || options.only_evaluate_locally {
                    return Some(results);
                }
            }
        }

        if options.only_evaluate_locally {
            return None;
        }

        let response = self
            .remote
            .fetch(
                distinct_id,
                &options.groups,
                &options.person_properties,
                &options.group_properties,
            )
            .await?;
        Some(response.flags)
    }

    fn record_call(&self, distinct_id: &str, key: &str, result: &FlagResult) {
        let value_repr = match &result.value {
            Some(value) => value.to_string(),
            None => return,
        };

        let mut calls = self.calls.lock().unwrap();
        let dedup_key = (distinct_id.to_string(), key.to_string(), value_repr);
        if calls.seen.insert(dedup_key) {
            let mut result = result.clone();
            result.evaluated_at =
                Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
            calls.pending.push(FlagCallEvent {
                distinct_id: distinct_id.to_string(),
                key: key.to_string(),
                result,
            });
        }
    }

    /// Atomically take the pending flag-called events.
    pub fn drain_flag_call_events(&self) -> Vec<FlagCallEvent> {
        std::mem::take(&mut self.calls.lock().unwrap().pending)
    }
}

impl FlagCallEvent {
    /// Properties of the `$feature_flag_called` event this call
    /// becomes on shutdown.
    pub(crate) fn event_properties(&self) -> Properties {
        let value = match &self.result.value {
            Some(FlagValue::Boolean(b)) => Value::Bool(*b),
            Some(FlagValue::String(s)) => Value::String(s.clone()),
            None => Value::Null,
        };

        let mut properties = Properties::new();
        properties.insert("$feature_flag".to_string(), Value::String(self.key.clone()));
        properties.insert("$feature_flag_response".to_string(), value.clone());
        properties.insert(format!("$feature/{}", self.key), value);
        properties.insert(
            "locally_evaluated".to_string(),
            Value::Bool(self.result.locally_evaluated),
        );

        if let Some(payload) = &self.result.payload {
            properties.insert("$feature_flag_payload".to_string(), payload.clone());
        }
        if let Some(request_id) = &self.result.request_id {
            properties.insert(
                "$feature_flag_request_id".to_string(),
                Value::String(request_id.clone()),
            );
        }
        if let Some(evaluated_at) = &self.result.evaluated_at {
            properties.insert(
                "$feature_flag_evaluated_at".to_string(),
                Value::String(evaluated_at.clone()),
            );
        }
        if let Some(reason) = &self.result.reason {
            properties.insert(
                "$feature_flag_reason".to_string(),
                Value::String(reason.clone()),
            );
        }
        if let Some(version) = self.result.flag_version {
            properties.insert("$feature_flag_version".to_string(), Value::from(version));
        }
        if let Some(id) = self.result.flag_id {
            properties.insert("$feature_flag_id".to_string(), Value::from(id));
        }
        properties
    }
}
