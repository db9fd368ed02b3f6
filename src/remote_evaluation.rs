use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::config::Config;
use crate::endpoints::Endpoint;
use crate::event::Properties;
use crate::feature_flags::{normalize_payload, FlagResult, FlagValue};
use crate::Error;

/// Detailed flag entry in the v2 decide response.
#[derive(Debug, Clone, Deserialize)]
pub struct FlagDetail {
    pub key: String,
    pub enabled: bool,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub reason: Option<FlagReason>,
    #[serde(default)]
    pub metadata: Option<FlagMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagReason {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagMetadata {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub payload: Option<Value>,
}

/// The decide endpoint reports quota limiting either as a bare bool or
/// as a list of limited resources.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum QuotaLimited {
    Flag(bool),
    Resources(Vec<String>),
}

/// Raw decide response; the v2 `flags` map and the legacy
/// `featureFlags`/`featureFlagPayloads` pair may both be present.
#[derive(Debug, Clone, Deserialize, Default)]
struct RawFlagsResponse {
    #[serde(default)]
    flags: Option<HashMap<String, FlagDetail>>,
    #[serde(default, rename = "featureFlags")]
    feature_flags: Option<HashMap<String, FlagValue>>,
    #[serde(default, rename = "featureFlagPayloads")]
    feature_flag_payloads: Option<HashMap<String, Value>>,
    #[serde(default, rename = "quotaLimited")]
    quota_limited: Option<QuotaLimited>,
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
}

/// Normalized decide response.
#[derive(Debug, Clone, Default)]
pub struct RemoteFlags {
    pub flags: HashMap<String, FlagResult>,
    pub quota_limited: Vec<String>,
    pub request_id: Option<String>,
}

impl RemoteFlags {
    pub fn is_quota_limited(&self) -> bool {
        self.quota_limited.iter().any(|r| r == "feature_flags")
    }
}

/// Client for the remote decide endpoint.
pub struct RemoteEvaluator {
    config: Arc<Config>,
    client: reqwest::Client,
    url: String,
}

impl RemoteEvaluator {
    pub fn new(config: Arc<Config>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.feature_flag_request_timeout)
            .danger_accept_invalid_certs(config.skip_tls_verification)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let url = config.endpoints.build_url(Endpoint::Flags);

        Ok(Self {
            config,
            client,
            url,
        })
    }

    /// POST the subject context and parse the decision set. Failures
    /// are reported through `on_error` and return `None`; a 402 comes
    /// back as an empty, quota-limited response.
    pub async fn fetch(
        &self,
        distinct_id: &str,
        groups: &HashMap<String, String>,
        person_properties: &Properties,
        group_properties: &HashMap<String, Properties>,
    ) -> Option<RemoteFlags> {
        let mut payload = json!({
            "api_key": self.config.api_key,
            "distinct_id": distinct_id,
            "geoip_disable": true,
        });
        if !groups.is_empty() {
            payload["groups"] = json!(groups);
        }
        if !person_properties.is_empty() {
            payload["person_properties"] = json!(person_properties);
        }
        if !group_properties.is_empty() {
            payload["group_properties"] = json!(group_properties);
        }

        let response = match self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.config
                    .report_error(-1, &format!("flag request failed: {e}"));
                return None;
            }
        };

        let status = response.status().as_u16();
        match status {
            402 => {
                self.config
                    .report_error(402, "feature flags quota limited, returning no flags");
                Some(RemoteFlags {
                    quota_limited: vec!["feature_flags".to_string()],
                    ..Default::default()
                })
            }
            401 | 403 => {
                self.config
                    .report_error(i32::from(status), "API key rejected by flag endpoint");
                None
            }
            s if (200..300).contains(&s) => match response.json::<RawFlagsResponse>().await {
                Ok(raw) => {
                    trace!(request_id = ?raw.request_id, "flag decisions fetched");
                    Some(normalize_response(raw))
                }
                Err(e) => {
                    self.config
                        .report_error(-1, &format!("failed to parse flag response: {e}"));
                    None
                }
            },
            s => {
                let body = response.text().await.unwrap_or_default();
                debug!(status = s, "flag request rejected");
                self.config
                    .report_error(i32::from(s), &format!("flag request failed: HTTP {s}: {body}"));
                None
            }
        }
    }
}

/// Collapse the two response encodings into one result map; the v2
/// `flags` map takes precedence when both are present.
fn normalize_response(raw: RawFlagsResponse) -> RemoteFlags {
    let request_id = raw.request_id.clone();
    let mut flags = HashMap::new();

    if let Some(details) = raw.flags {
        for (key, detail) in details {
            let value = if detail.enabled {
                match detail.variant {
                    Some(variant) => FlagValue::String(variant),
                    None => FlagValue::Boolean(true),
                }
            } else {
                FlagValue::Boolean(false)
            };
            let (flag_id, flag_version, payload) = match detail.metadata {
                Some(metadata) => (
                    metadata.id,
                    metadata.version,
                    metadata.payload.map(normalize_payload),
                ),
                None => (None, None, None),
            };
            let reason = detail
                .reason
                .and_then(|r| r.description.or(r.code));

            flags.insert(
                key,
                FlagResult {
                    value: Some(value),
                    reason,
                    flag_id,
                    flag_version,
                    payload,
                    locally_evaluated: false,
                    request_id: request_id.clone(),
                    evaluated_at: None,
                },
            );
        }
    } else if let Some(values) = raw.feature_flags {
        let mut payloads = raw.feature_flag_payloads.unwrap_or_default();
        for (key, value) in values {
            let payload = payloads.remove(&key).map(normalize_payload);
            flags.insert(
                key,
                FlagResult {
                    value: Some(value),
                    payload,
                    locally_evaluated: false,
                    request_id: request_id.clone(),
                    ..Default::default()
                },
            );
        }
    }

    let quota_limited = match raw.quota_limited {
        Some(QuotaLimited::Flag(true)) => vec!["feature_flags".to_string()],
        Some(QuotaLimited::Flag(false)) | None => Vec::new(),
        Some(QuotaLimited::Resources(resources)) => resources,
    };

    RemoteFlags {
        flags,
        quota_limited,
        request_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_response_takes_precedence_over_legacy() {
        let raw: RawFlagsResponse = serde_json::from_value(json!({
            "flags": {
                "checkout": {
                    "key": "checkout",
                    "enabled": true,
                    "variant": "test",
                    "reason": {"code": "condition_match", "description": "matched condition 0"},
                    "metadata": {"id": 3, "version": 8, "payload": "{\"size\": 2}"}
                },
                "dark-mode": {"key": "dark-mode", "enabled": false, "variant": null}
            },
            "featureFlags": {"checkout": "legacy-should-lose"},
            "requestId": "req-1"
        }))
        .unwrap();

        let normalized = normalize_response(raw);
        let checkout = &normalized.flags["checkout"];
        assert_eq!(checkout.value, Some(FlagValue::String("test".to_string())));
        assert_eq!(checkout.flag_id, Some(3));
        assert_eq!(checkout.flag_version, Some(8));
        assert_eq!(checkout.payload, Some(json!({"size": 2})));
        assert_eq!(checkout.reason.as_deref(), Some("matched condition 0"));
        assert_eq!(checkout.request_id.as_deref(), Some("req-1"));

        let dark = &normalized.flags["dark-mode"];
        assert_eq!(dark.value, Some(FlagValue::Boolean(false)));
    }

    #[test]
    fn legacy_response_parses_values_and_payloads() {
        let raw: RawFlagsResponse = serde_json::from_value(json!({
            "featureFlags": {"beta": true, "exp": "control"},
            "featureFlagPayloads": {"exp": "[1, 2, 3]"}
        }))
        .unwrap();

        let normalized = normalize_response(raw);
        assert_eq!(
            normalized.flags["beta"].value,
            Some(FlagValue::Boolean(true))
        );
        assert_eq!(
            normalized.flags["exp"].value,
            Some(FlagValue::String("control".to_string()))
        );
        assert_eq!(normalized.flags["exp"].payload, Some(json!([1, 2, 3])));
    }

    #[test]
    fn quota_limited_accepts_bool_and_list() {
        let raw: RawFlagsResponse =
            serde_json::from_value(json!({"quotaLimited": true})).unwrap();
        assert!(normalize_response(raw).is_quota_limited());

        let raw: RawFlagsResponse =
            serde_json::from_value(json!({"quotaLimited": ["feature_flags"]})).unwrap();
        assert!(normalize_response(raw).is_quota_limited());

        let raw: RawFlagsResponse =
            serde_json::from_value(json!({"quotaLimited": ["recordings"]})).unwrap();
        assert!(!normalize_response(raw).is_quota_limited());

        let raw: RawFlagsResponse = serde_json::from_value(json!({"quotaLimited": false})).unwrap();
        assert!(!normalize_response(raw).is_quota_limited());
    }
}
