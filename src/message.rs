use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::event::{Event, Properties};
use crate::exception::{self, Exception};
use crate::{Error, LIB_NAME, LIB_VERSION};

/// Message kind carried in the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Capture,
    Identify,
    Alias,
    GroupIdentify,
    Exception,
}

/// The unit of delivery: a validated, normalized event as it appears
/// inside the `/batch` payload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub event: String,
    pub distinct_id: String,
    /// ISO-8601 UTC with millisecond precision and trailing `Z`.
    pub timestamp: String,
    /// Fresh v4 UUID per normalization call.
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub properties: Map<String, Value>,
    /// Person properties; only present on identify messages.
    #[serde(rename = "$set", default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Map<String, Value>>,
    pub library: String,
    pub library_version: String,
    /// Caller-supplied event UUID, kept only when it parsed as v4.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

impl Message {
    fn base(kind: MessageKind, event: String, distinct_id: String) -> Self {
        let mut properties = Map::new();
        properties.insert("$lib".to_string(), Value::String(LIB_NAME.to_string()));
        properties.insert(
            "$lib_version".to_string(),
            Value::String(LIB_VERSION.to_string()),
        );

        Self {
            kind,
            event,
            distinct_id,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            message_id: Uuid::new_v4().to_string(),
            properties,
            set: None,
            library: LIB_NAME.to_string(),
            library_version: LIB_VERSION.to_string(),
            uuid: None,
        }
    }

    pub fn capture(input: Event) -> Result<Self, Error> {
        require("distinct_id", &input.distinct_id)?;
        require("event", &input.event)?;

        let mut message = Self::base(MessageKind::Capture, input.event, input.distinct_id);
        for (key, value) in input.properties {
            message.properties.insert(key, value);
        }

        if !input.groups.is_empty() {
            let groups: Map<String, Value> = input
                .groups
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect();
            message
                .properties
                .insert("$groups".to_string(), Value::Object(groups));
        }

        if !input.feature_variants.is_empty() {
            let mut active: Vec<String> = input
                .feature_variants
                .iter()
                .filter(|(_, value)| **value != Value::Bool(false))
                .map(|(key, _)| key.clone())
                .collect();
            active.sort();

            for (key, value) in input.feature_variants {
                message.properties.insert(format!("$feature/{key}"), value);
            }
            message.properties.insert(
                "$active_feature_flags".to_string(),
                Value::Array(active.into_iter().map(Value::String).collect()),
            );
        }

        message.uuid = input.uuid.filter(|u| is_valid_uuid_v4(u));
        Ok(message)
    }

    pub fn identify(distinct_id: &str, properties: Properties) -> Result<Self, Error> {
        require("distinct_id", distinct_id)?;

        let mut message = Self::base(
            MessageKind::Identify,
            "$identify".to_string(),
            distinct_id.to_string(),
        );
        message.set = Some(properties.into_iter().collect());
        Ok(message)
    }

    pub fn alias(distinct_id: &str, alias: &str) -> Result<Self, Error> {
        require("distinct_id", distinct_id)?;
        require("alias", alias)?;

        let mut message = Self::base(
            MessageKind::Alias,
            "$create_alias".to_string(),
            distinct_id.to_string(),
        );
        message.properties.insert(
            "distinct_id".to_string(),
            Value::String(distinct_id.to_string()),
        );
        message
            .properties
            .insert("alias".to_string(), Value::String(alias.to_string()));
        Ok(message)
    }

    pub fn group_identify(
        group_type: &str,
        group_key: &str,
        properties: Properties,
        distinct_id: Option<&str>,
    ) -> Result<Self, Error> {
        require("group_type", group_type)?;
        require("group_key", group_key)?;

        let distinct_id = match distinct_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("${group_type}_{group_key}"),
        };

        let mut message = Self::base(
            MessageKind::GroupIdentify,
            "$groupidentify".to_string(),
            distinct_id,
        );
        message.properties.insert(
            "$group_type".to_string(),
            Value::String(group_type.to_string()),
        );
        message.properties.insert(
            "$group_key".to_string(),
            Value::String(group_key.to_string()),
        );
        message.properties.insert(
            "$group_set".to_string(),
            Value::Object(properties.into_iter().collect()),
        );
        Ok(message)
    }

    pub fn exception(
        distinct_id: &str,
        exception: &Exception,
        properties: Properties,
    ) -> Result<Self, Error> {
        require("distinct_id", distinct_id)?;

        let mut message = Self::base(
            MessageKind::Exception,
            "$exception".to_string(),
            distinct_id.to_string(),
        );
        for (key, value) in properties {
            message.properties.insert(key, value);
        }
        for (key, value) in exception::serialize_exception(exception) {
            message.properties.insert(key, value);
        }
        Ok(message)
    }
}

fn require(field: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::missing(field));
    }
    Ok(())
}

fn is_valid_uuid_v4(value: &str) -> bool {
    Uuid::parse_str(value)
        .map(|u| u.get_version_num() == 4)
        .unwrap_or(false)
}
