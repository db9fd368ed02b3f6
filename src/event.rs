use std::collections::HashMap;

use serde::Serialize;

use crate::Error;

/// A bag of JSON-valued properties keyed by name.
pub type Properties = HashMap<String, serde_json::Value>;

/// Caller-side input for [`Client::capture`](crate::Client::capture).
///
/// Carries everything the normalizer needs to build a wire message:
/// the event name, the distinct id, free-form properties, group
/// memberships, and the feature-flag variants active for the subject.
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub(crate) event: String,
    pub(crate) distinct_id: String,
    pub(crate) properties: Properties,
    pub(crate) groups: HashMap<String, String>,
    pub(crate) feature_variants: HashMap<String, serde_json::Value>,
    pub(crate) uuid: Option<String>,
}

impl Event {
    pub fn new<S: Into<String>>(event: S, distinct_id: S) -> Self {
        Self {
            event: event.into(),
            distinct_id: distinct_id.into(),
            ..Default::default()
        }
    }

    /// Errors if `prop` fails to serialize
    pub fn insert_prop<K: Into<String>, P: Serialize>(
        &mut self,
        key: K,
        prop: P,
    ) -> Result<(), Error> {
        let as_json =
            serde_json::to_value(prop).map_err(|e| Error::Serialization(e.to_string()))?;
        let _ = self.properties.insert(key.into(), as_json);
        Ok(())
    }

    /// Associate the event with a group, e.g. `("company", "acme")`.
    pub fn set_group<K: Into<String>, V: Into<String>>(&mut self, group_type: K, group_key: V) {
        self.groups.insert(group_type.into(), group_key.into());
    }

    /// Record the flag variant that was active when the event fired;
    /// emitted as `$feature/<key>` and rolled into
    /// `$active_feature_flags`.
    pub fn set_feature_variant<K: Into<String>, P: Serialize>(
        &mut self,
        key: K,
        value: P,
    ) -> Result<(), Error> {
        let as_json =
            serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        self.feature_variants.insert(key.into(), as_json);
        Ok(())
    }

    /// Supply an explicit event UUID. Values that are not canonical
    /// v4 UUIDs are dropped during normalization.
    pub fn set_uuid<S: Into<String>>(&mut self, uuid: S) {
        self.uuid = Some(uuid.into());
    }
}
