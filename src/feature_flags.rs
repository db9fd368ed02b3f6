use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::event::Properties;

/// Global cache for compiled regexes to avoid recompilation on every flag evaluation
static REGEX_CACHE: OnceLock<Mutex<HashMap<String, Option<Regex>>>> = OnceLock::new();

/// Salt used for rollout percentage hashing. Intentionally empty to match PostHog's
/// consistent hashing algorithm across all SDKs.
const ROLLOUT_HASH_SALT: &str = "";

/// Salt used for multivariate variant selection, shared by all PostHog SDKs
/// so the same user gets the same variant everywhere.
const VARIANT_HASH_SALT: &str = "variant";

/// Relative-date magnitudes beyond this are treated as unparseable.
const MAX_RELATIVE_DATE_MAGNITUDE: i64 = 10_000;

const LONG_SCALE: f64 = 0xFFFFFFFFFFFFFFFu64 as f64; // Must be exactly 15 F's to match the other SDKs

fn get_cached_regex(pattern: &str) -> Option<Regex> {
    let cache = REGEX_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache_guard = match cache.lock() {
        Ok(guard) => guard,
        Err(_) => {
            tracing::warn!(pattern, "regex cache mutex poisoned, treating as cache miss");
            return None;
        }
    };

    if let Some(cached) = cache_guard.get(pattern) {
        return cached.clone();
    }

    let compiled = Regex::new(pattern).ok();
    cache_guard.insert(pattern.to_string(), compiled.clone());
    compiled
}

/// The value of a feature flag evaluation.
///
/// Feature flags resolve to either a boolean (enabled/disabled) or a
/// string variant key for multivariate flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    String(String),
}

impl FlagValue {
    /// Whether the value counts as enabled (true or any variant).
    pub fn is_enabled(&self) -> bool {
        match self {
            FlagValue::Boolean(b) => *b,
            FlagValue::String(_) => true,
        }
    }

    /// The payload-table key for this value: the variant string, or
    /// `"true"`/`"false"` for booleans.
    pub(crate) fn payload_key(&self) -> String {
        match self {
            FlagValue::Boolean(b) => b.to_string(),
            FlagValue::String(s) => s.clone(),
        }
    }
}

impl Default for FlagValue {
    fn default() -> Self {
        FlagValue::Boolean(false)
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Boolean(b) => write!(f, "{b}"),
            FlagValue::String(s) => write!(f, "{s}"),
        }
    }
}

/// Error returned when a feature flag cannot be evaluated locally.
///
/// Raised for missing properties, invalid regexes, unparseable dates,
/// unknown operators, and uncached dependencies. Recoverable: the
/// evaluator tries the next condition group, and the client falls back
/// to remote evaluation.
#[derive(Debug, Clone)]
pub struct InconclusiveMatchError {
    pub message: String,
}

impl InconclusiveMatchError {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for InconclusiveMatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InconclusiveMatchError {}

/// Why a local evaluation could not produce an answer.
#[derive(Debug, Clone)]
pub enum FlagError {
    /// The answer could not be determined from the provided bags.
    Inconclusive(InconclusiveMatchError),
    /// The definition needs state only the server has (static cohorts,
    /// experience continuity).
    RequiresServerEvaluation,
}

impl FlagError {
    pub(crate) fn inconclusive(message: &str) -> Self {
        FlagError::Inconclusive(InconclusiveMatchError::new(message))
    }
}

impl fmt::Display for FlagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagError::Inconclusive(e) => write!(f, "{e}"),
            FlagError::RequiresServerEvaluation => write!(f, "flag requires server-side evaluation"),
        }
    }
}

impl std::error::Error for FlagError {}

impl From<InconclusiveMatchError> for FlagError {
    fn from(e: InconclusiveMatchError) -> Self {
        FlagError::Inconclusive(e)
    }
}

/// The outcome of one flag query, local or remote.
#[derive(Debug, Clone, Default)]
pub struct FlagResult {
    /// `None` when no decision could be made.
    pub value: Option<FlagValue>,
    pub reason: Option<String>,
    pub flag_id: Option<u64>,
    pub flag_version: Option<u32>,
    pub payload: Option<Value>,
    pub locally_evaluated: bool,
    /// Server request id, remote evaluations only.
    pub request_id: Option<String>,
    /// When the decision was made, stamped at record time.
    pub evaluated_at: Option<String>,
}

impl FlagResult {
    /// Whether the decision counts as enabled.
    pub fn is_enabled(&self) -> bool {
        self.value.as_ref().map(FlagValue::is_enabled).unwrap_or(false)
    }
}

/// Look up the payload for a decided flag value. The table is keyed by
/// the variant string, or by `"true"`/`"false"` for boolean results;
/// payloads that arrive as JSON-encoded strings are re-parsed.
pub(crate) fn lookup_payload(flag: &FeatureFlag, value: &FlagValue) -> Option<Value> {
    flag.filters
        .payloads
        .get(&value.payload_key())
        .cloned()
        .map(normalize_payload)
}

/// Payloads may be double-encoded; prefer the parsed form, fall back
/// to the raw string.
pub(crate) fn normalize_payload(payload: Value) -> Value {
    if let Value::String(raw) = &payload {
        if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
            return parsed;
        }
    }
    payload
}

/// A feature flag definition as served by the local-evaluation API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub version: Option<u32>,
    /// Inactive flags always evaluate to false.
    pub active: bool,
    /// Flags pinned to first-seen values cannot be decided locally.
    #[serde(default)]
    pub ensure_experience_continuity: bool,
    #[serde(default)]
    pub filters: FlagFilters,
}

/// Targeting rules and configuration for a feature flag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlagFilters {
    /// Condition groups; the first matching group wins.
    #[serde(default)]
    pub groups: Vec<FlagConditionGroup>,
    /// Multivariate configuration for A/B/n tests.
    #[serde(default)]
    pub multivariate: Option<Multivariate>,
    /// Payloads keyed by variant, or `"true"`/`"false"` for booleans.
    #[serde(default)]
    pub payloads: HashMap<String, Value>,
    /// When set, the flag targets a group type instead of persons.
    #[serde(default)]
    pub aggregation_group_type_index: Option<i64>,
}

/// A single condition group: all properties must match (AND), then the
/// subject must fall inside the rollout percentage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagConditionGroup {
    #[serde(default)]
    pub properties: Vec<FlagProperty>,
    pub rollout_percentage: Option<f64>,
}

/// Multivariate configuration: ordered variants partition `[0, 1)`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Multivariate {
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub key: String,
    pub rollout_percentage: f64,
}

/// A property condition inside a flag or cohort definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagProperty {
    pub key: String,
    pub value: Value,
    #[serde(default = "default_operator")]
    pub operator: String,
    /// Inverts the outcome of this condition.
    #[serde(default)]
    pub negation: Option<bool>,
    /// `"cohort"` and `"flag"` conditions resolve through the caches;
    /// anything else matches against the property bag directly.
    #[serde(rename = "type", default)]
    pub property_type: Option<String>,
    /// Flag dependencies list their prerequisites in resolution order.
    /// An empty chain marks a cycle detected by the server.
    #[serde(default)]
    pub dependency_chain: Option<Vec<String>>,
}

fn default_operator() -> String {
    "exact".to_string()
}

/// Boolean combinator for a recursive cohort property group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupLogic {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

/// Recursive AND/OR property group, the body of a cohort definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyGroup {
    #[serde(rename = "type")]
    pub logic: GroupLogic,
    #[serde(default)]
    pub values: Vec<GroupValue>,
}

/// A property-group entry: either a nested group or a leaf condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GroupValue {
    Group(PropertyGroup),
    Property(FlagProperty),
}

/// Everything a single top-level evaluation needs: the definition
/// caches, the hashing subject, the property bag, and the per-call
/// cache that flag dependencies share.
pub(crate) struct MatchContext<'a> {
    pub flags: &'a HashMap<String, FeatureFlag>,
    pub cohorts: &'a HashMap<String, PropertyGroup>,
    pub subject: &'a str,
    pub properties: &'a Properties,
    pub evaluation_cache: RefCell<HashMap<String, FlagValue>>,
}

impl<'a> MatchContext<'a> {
    pub(crate) fn new(
        flags: &'a HashMap<String, FeatureFlag>,
        cohorts: &'a HashMap<String, PropertyGroup>,
        subject: &'a str,
        properties: &'a Properties,
    ) -> Self {
        Self {
            flags,
            cohorts,
            subject,
            properties,
            evaluation_cache: RefCell::new(HashMap::new()),
        }
    }
}

/// Compute a deterministic hash value for feature flag bucketing.
///
/// SHA-1 of `"<key>.<distinct_id><salt>"`, first 15 hex characters as
/// a 60-bit integer, scaled into `[0, 1]`. Shared across SDKs so the
/// same subject gets the same bucket everywhere.
pub fn hash_key(key: &str, distinct_id: &str, salt: &str) -> f64 {
    let hash_input = format!("{key}.{distinct_id}{salt}");
    let mut hasher = Sha1::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();
    let hex_str = format!("{result:x}");
    let hash_val = u64::from_str_radix(&hex_str[..15], 16).unwrap_or(0);
    hash_val as f64 / LONG_SCALE
}

/// Whether the subject falls inside a rollout percentage.
///
/// 100 always matches and 0 never does, independent of the hash.
pub fn in_rollout(key: &str, distinct_id: &str, percentage: f64) -> bool {
    if percentage >= 100.0 {
        return true;
    }
    hash_key(key, distinct_id, ROLLOUT_HASH_SALT) < percentage / 100.0
}

/// Determine which variant a subject should see for a multivariate
/// flag. Variants occupy contiguous ranges of `[0, 1)` in declaration
/// order; returns `None` when the flag has no variants or the hash
/// lands outside every range.
pub fn get_matching_variant(flag: &FeatureFlag, distinct_id: &str) -> Option<String> {
    let hash_value = hash_key(&flag.key, distinct_id, VARIANT_HASH_SALT);
    let variants = flag.filters.multivariate.as_ref()?.variants.as_slice();

    let mut value_min = 0.0;
    for variant in variants {
        let value_max = value_min + variant.rollout_percentage / 100.0;
        if hash_value >= value_min && hash_value < value_max {
            return Some(variant.key.clone());
        }
        value_min = value_max;
    }
    None
}

/// Evaluate a flag's condition groups against the context.
///
/// Groups are tried in declaration order; the first full match wins
/// and resolves to a variant (via the variant salt) or `true`. When no
/// group matches but at least one was inconclusive, the last such
/// error is raised so the caller can fall back to remote evaluation.
pub(crate) fn match_flag_conditions(
    flag: &FeatureFlag,
    ctx: &MatchContext,
) -> Result<FlagValue, FlagError> {
    let mut last_error: Option<FlagError> = None;

    for group in &flag.filters.groups {
        match match_condition_group(flag, group, ctx) {
            Ok(true) => {
                if let Some(variant) = get_matching_variant(flag, ctx.subject) {
                    return Ok(FlagValue::String(variant));
                }
                return Ok(FlagValue::Boolean(true));
            }
            Ok(false) => continue,
            Err(FlagError::RequiresServerEvaluation) => {
                return Err(FlagError::RequiresServerEvaluation)
            }
            Err(e) => last_error = Some(e),
        }
    }

    if let Some(error) = last_error {
        return Err(error);
    }
    Ok(FlagValue::Boolean(false))
}

fn match_condition_group(
    flag: &FeatureFlag,
    group: &FlagConditionGroup,
    ctx: &MatchContext,
) -> Result<bool, FlagError> {
    for property in &group.properties {
        if !match_condition(property, ctx)? {
            return Ok(false);
        }
    }

    match group.rollout_percentage {
        Some(rollout) => Ok(in_rollout(&flag.key, ctx.subject, rollout)),
        None => Ok(true),
    }
}

/// Match one leaf condition, routing cohort and flag conditions
/// through their caches and applying `negation` to the outcome.
pub(crate) fn match_condition(
    property: &FlagProperty,
    ctx: &MatchContext,
) -> Result<bool, FlagError> {
    let result = match property.property_type.as_deref() {
        Some("cohort") => match_cohort(property, ctx)?,
        Some("flag") => match_flag_dependency(property, ctx)?,
        _ => match_property(property, ctx.properties)?,
    };
    Ok(result ^ property.negation.unwrap_or(false))
}

/// Evaluate a recursive AND/OR property group. Empty groups match.
pub(crate) fn match_property_group(
    group: &PropertyGroup,
    ctx: &MatchContext,
) -> Result<bool, FlagError> {
    if group.values.is_empty() {
        return Ok(true);
    }

    for value in &group.values {
        let matched = match value {
            GroupValue::Group(inner) => match_property_group(inner, ctx)?,
            GroupValue::Property(property) => match_condition(property, ctx)?,
        };
        match group.logic {
            GroupLogic::And if !matched => return Ok(false),
            GroupLogic::Or if matched => return Ok(true),
            _ => {}
        }
    }

    Ok(group.logic == GroupLogic::And)
}

/// Resolve a cohort-membership condition through the cohort table.
///
/// Cohorts reference each other by id and are resolved lazily; an id
/// missing from the cache is most likely a static cohort, which only
/// the server can evaluate.
fn match_cohort(property: &FlagProperty, ctx: &MatchContext) -> Result<bool, FlagError> {
    let cohort_id = match &property.value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(FlagError::inconclusive(&format!(
                "cohort id must be a string or number, got {other}"
            )))
        }
    };

    let cohort = ctx
        .cohorts
        .get(&cohort_id)
        .ok_or(FlagError::RequiresServerEvaluation)?;

    let matched = match_property_group(cohort, ctx)?;
    Ok(if property.operator == "not_in" {
        !matched
    } else {
        matched
    })
}

/// Resolve a flag-dependency condition.
///
/// Prerequisites named in `dependency_chain` are evaluated first, in
/// order, into the shared per-call cache; the condition's own flag
/// value is then compared with `flag_evaluates_to` semantics. An empty
/// chain is the server's marker for a circular dependency.
fn match_flag_dependency(property: &FlagProperty, ctx: &MatchContext) -> Result<bool, FlagError> {
    if property.operator != "flag_evaluates_to" {
        return Err(FlagError::inconclusive(&format!(
            "unsupported flag dependency operator: {}",
            property.operator
        )));
    }

    match &property.dependency_chain {
        Some(chain) if chain.is_empty() => {
            return Err(FlagError::inconclusive(&format!(
                "circular dependency detected for flag '{}'",
                property.key
            )));
        }
        Some(chain) => {
            for key in chain {
                ensure_dependency_evaluated(key, ctx)?;
            }
        }
        None => {}
    }

    let actual = ensure_dependency_evaluated(&property.key, ctx)?;
    Ok(flag_evaluates_to(&actual, &property.value))
}

/// Evaluate a dependency flag into the per-call cache, without
/// continuity gating. Inactive dependencies resolve to `false`.
fn ensure_dependency_evaluated(key: &str, ctx: &MatchContext) -> Result<FlagValue, FlagError> {
    if let Some(value) = ctx.evaluation_cache.borrow().get(key) {
        return Ok(value.clone());
    }

    let flag = ctx.flags.get(key).ok_or_else(|| {
        FlagError::inconclusive(&format!("dependency flag '{key}' not found in local cache"))
    })?;

    let value = if !flag.active {
        FlagValue::Boolean(false)
    } else {
        match_flag_conditions(flag, ctx)?
    };

    ctx.evaluation_cache
        .borrow_mut()
        .insert(key.to_string(), value.clone());
    Ok(value)
}

/// `flag_evaluates_to` comparison: an expected `true` accepts any
/// enabled value (boolean true or a variant), an expected string
/// requires case-sensitive variant equality, and an expected `false`
/// accepts a disabled flag.
fn flag_evaluates_to(actual: &FlagValue, expected: &Value) -> bool {
    match (actual, expected) {
        (FlagValue::Boolean(true), Value::Bool(true)) => true,
        (FlagValue::String(s), Value::Bool(true)) => !s.is_empty(),
        (FlagValue::Boolean(false), Value::Bool(false)) => true,
        (FlagValue::String(s), Value::String(expected)) => s == expected,
        _ => false,
    }
}

/// Evaluate one plain property condition against the property bag.
///
/// Every operator except `is_not_set` raises
/// [`InconclusiveMatchError`] when the key is absent.
pub fn match_property(
    property: &FlagProperty,
    properties: &Properties,
) -> Result<bool, InconclusiveMatchError> {
    let value = match properties.get(&property.key) {
        Some(v) => v,
        None => {
            if property.operator == "is_not_set" {
                return Ok(true);
            }
            return Err(InconclusiveMatchError::new(&format!(
                "property '{}' not found in provided properties",
                property.key
            )));
        }
    };

    Ok(match property.operator.as_str() {
        "exact" => exact_match(&property.value, value),
        "is_not" => !exact_match(&property.value, value),
        "is_set" => true,      // the property exists
        "is_not_set" => false, // the property exists
        "icontains" => {
            let prop_str = value_to_string(value).to_lowercase();
            let search_str = value_to_string(&property.value).to_lowercase();
            prop_str.contains(&search_str)
        }
        "not_icontains" => {
            let prop_str = value_to_string(value).to_lowercase();
            let search_str = value_to_string(&property.value).to_lowercase();
            !prop_str.contains(&search_str)
        }
        "regex" | "not_regex" => {
            let prop_str = value_to_string(value);
            let pattern = value_to_string(&property.value);
            let regex = get_cached_regex(&pattern).ok_or_else(|| {
                InconclusiveMatchError::new(&format!("invalid regex pattern: {pattern}"))
            })?;
            if property.operator == "regex" {
                regex.is_match(&prop_str)
            } else {
                !regex.is_match(&prop_str)
            }
        }
        "gt" | "gte" | "lt" | "lte" => compare_ordered(&property.operator, &property.value, value),
        "is_date_before" | "is_date_after" => {
            let target_date = parse_condition_date(&property.value).ok_or_else(|| {
                InconclusiveMatchError::new(&format!(
                    "unable to parse condition date value: {:?}",
                    property.value
                ))
            })?;
            let prop_date = parse_property_date(value).ok_or_else(|| {
                InconclusiveMatchError::new(&format!(
                    "unable to parse property date value for '{}': {value:?}",
                    property.key
                ))
            })?;

            if property.operator == "is_date_before" {
                prop_date < target_date
            } else {
                prop_date > target_date
            }
        }
        unknown => {
            return Err(InconclusiveMatchError::new(&format!(
                "unknown operator: {unknown}"
            )));
        }
    })
}

/// Case-insensitive equality; a list condition value matches when any
/// element matches.
fn exact_match(condition_value: &Value, property_value: &Value) -> bool {
    if let Some(candidates) = condition_value.as_array() {
        return candidates
            .iter()
            .any(|candidate| compare_values(candidate, property_value));
    }
    compare_values(condition_value, property_value)
}

fn compare_values(a: &Value, b: &Value) -> bool {
    if let (Some(a_str), Some(b_str)) = (a.as_str(), b.as_str()) {
        return a_str.eq_ignore_ascii_case(b_str);
    }
    a == b
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => value.to_string(),
    }
}

/// Numeric comparison when both sides coerce to numbers, lexicographic
/// string comparison otherwise.
fn compare_ordered(operator: &str, condition_value: &Value, property_value: &Value) -> bool {
    let cond_num = coerce_number(condition_value);
    let prop_num = coerce_number(property_value);

    if let (Some(cond), Some(prop)) = (cond_num, prop_num) {
        match operator {
            "gt" => prop > cond,
            "gte" => prop >= cond,
            "lt" => prop < cond,
            "lte" => prop <= cond,
            _ => false,
        }
    } else {
        let cond_str = value_to_string(condition_value);
        let prop_str = value_to_string(property_value);
        match operator {
            "gt" => prop_str > cond_str,
            "gte" => prop_str >= cond_str,
            "lt" => prop_str < cond_str,
            "lte" => prop_str <= cond_str,
            _ => false,
        }
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Parse a condition date: either a relative date like `-7d` or an
/// absolute date.
fn parse_condition_date(value: &Value) -> Option<DateTime<Utc>> {
    let date_str = value.as_str()?;
    parse_relative_date(date_str).or_else(|| parse_absolute_date(date_str))
}

/// Parse a property date: integer/float unix seconds, or a string
/// absolute date.
fn parse_property_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            Utc.timestamp_opt(secs as i64, 0).single()
        }
        Value::String(s) => parse_absolute_date(s),
        _ => None,
    }
}

/// Relative dates use the grammar `-?\d+[hdwmy]` with the magnitude
/// capped at 10 000; months and years are approximated as 30 and 365
/// days to match the other SDKs.
fn parse_relative_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let stripped = value.strip_prefix('-').unwrap_or(value);
    if stripped.len() < 2 {
        return None;
    }

    let (num_str, unit) = stripped.split_at(stripped.len() - 1);
    let num: i64 = num_str.parse().ok()?;
    if num > MAX_RELATIVE_DATE_MAGNITUDE {
        return None;
    }

    let duration = match unit {
        "h" => chrono::Duration::hours(num),
        "d" => chrono::Duration::days(num),
        "w" => chrono::Duration::weeks(num),
        "m" => chrono::Duration::days(num * 30),
        "y" => chrono::Duration::days(num * 365),
        _ => return None,
    };

    Some(Utc::now() - duration)
}

/// Absolute dates accept RFC-3339, `YYYY-MM-DDTHH:MM:SS` (interpreted
/// UTC), and bare `YYYY-MM-DD`.
fn parse_absolute_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn simple_flag(key: &str, rollout: Option<f64>) -> FeatureFlag {
        FeatureFlag {
            key: key.to_string(),
            id: Some(1),
            version: Some(1),
            active: true,
            ensure_experience_continuity: false,
            filters: FlagFilters {
                groups: vec![FlagConditionGroup {
                    properties: vec![],
                    rollout_percentage: rollout,
                }],
                multivariate: None,
                payloads: HashMap::new(),
                aggregation_group_type_index: None,
            },
        }
    }

    fn property(key: &str, operator: &str, value: Value) -> FlagProperty {
        FlagProperty {
            key: key.to_string(),
            value,
            operator: operator.to_string(),
            negation: None,
            property_type: None,
            dependency_chain: None,
        }
    }

    fn context<'a>(
        flags: &'a HashMap<String, FeatureFlag>,
        cohorts: &'a HashMap<String, PropertyGroup>,
        subject: &'a str,
        properties: &'a Properties,
    ) -> MatchContext<'a> {
        MatchContext::new(flags, cohorts, subject, properties)
    }

    // ==================== Hashing ====================

    #[test]
    fn hash_is_deterministic_and_in_range() {
        let hash = hash_key("test-flag", "user-123", "");
        assert!((0.0..=1.0).contains(&hash));
        assert_eq!(hash, hash_key("test-flag", "user-123", ""));
        assert_ne!(hash, hash_key("test-flag", "user-456", ""));
        assert_ne!(hash, hash_key("test-flag", "user-123", VARIANT_HASH_SALT));
    }

    #[test]
    fn rollout_boundaries_are_absolute() {
        for subject in ["a", "b", "user-99", ""] {
            assert!(in_rollout("any-flag", subject, 100.0));
            assert!(!in_rollout("any-flag", subject, 0.0));
        }
    }

    #[test]
    fn hash_scale_constant_is_fifteen_fs() {
        assert_eq!(LONG_SCALE, 0xFFFFFFFFFFFFFFFu64 as f64);
        assert_ne!(LONG_SCALE, 0xFFFFFFFFFFFFFFFFu64 as f64);
    }

    #[test]
    fn fifty_percent_rollout_splits_a_population() {
        let mut enabled = 0;
        for i in 0..1000 {
            if in_rollout("rollout-flag", &format!("user-{i}"), 50.0) {
                enabled += 1;
            }
        }
        assert!((400..=600).contains(&enabled), "enabled = {enabled}");
    }

    #[test]
    fn variant_assignment_is_exhaustive_when_rollouts_sum_to_100() {
        let mut flag = simple_flag("exp", Some(100.0));
        flag.filters.multivariate = Some(Multivariate {
            variants: vec![
                Variant {
                    key: "control".to_string(),
                    rollout_percentage: 50.0,
                },
                Variant {
                    key: "test".to_string(),
                    rollout_percentage: 50.0,
                },
            ],
        });

        for i in 0..500 {
            let variant = get_matching_variant(&flag, &format!("user-{i}"));
            let v = variant.expect("every subject gets exactly one variant");
            assert!(v == "control" || v == "test");
        }

        // Deterministic across repeats.
        assert_eq!(
            get_matching_variant(&flag, "user-123"),
            get_matching_variant(&flag, "user-123")
        );
    }

    // ==================== Property matcher ====================

    #[test]
    fn exact_is_case_insensitive() {
        let prop = property("country", "exact", json!("US"));
        let mut bag = Properties::new();
        bag.insert("country".to_string(), json!("us"));
        assert!(match_property(&prop, &bag).unwrap());

        bag.insert("country".to_string(), json!("UK"));
        assert!(!match_property(&prop, &bag).unwrap());
    }

    #[test]
    fn exact_with_list_matches_any_element() {
        let prop = property("plan", "exact", json!(["free", "trial"]));
        let mut bag = Properties::new();
        bag.insert("plan".to_string(), json!("TRIAL"));
        assert!(match_property(&prop, &bag).unwrap());

        bag.insert("plan".to_string(), json!("paid"));
        assert!(!match_property(&prop, &bag).unwrap());
    }

    #[test]
    fn is_not_negates_exact() {
        let prop = property("plan", "is_not", json!("free"));
        let mut bag = Properties::new();
        bag.insert("plan".to_string(), json!("paid"));
        assert!(match_property(&prop, &bag).unwrap());
        bag.insert("plan".to_string(), json!("free"));
        assert!(!match_property(&prop, &bag).unwrap());
    }

    #[test]
    fn missing_key_is_inconclusive_except_is_not_set() {
        let mut bag = Properties::new();

        let err = match_property(&property("email", "exact", json!("x")), &bag).unwrap_err();
        assert!(err.message.contains("email"));

        // is_set on a missing key is inconclusive too
        assert!(match_property(&property("email", "is_set", json!(true)), &bag).is_err());

        assert!(match_property(&property("email", "is_not_set", json!(true)), &bag).unwrap());

        bag.insert("email".to_string(), json!("a@b.com"));
        assert!(match_property(&property("email", "is_set", json!(true)), &bag).unwrap());
        assert!(!match_property(&property("email", "is_not_set", json!(true)), &bag).unwrap());
    }

    #[test]
    fn icontains_is_case_insensitive_substring() {
        let prop = property("email", "icontains", json!("@example.com"));
        let mut bag = Properties::new();
        bag.insert("email".to_string(), json!("user@EXAMPLE.com"));
        assert!(match_property(&prop, &bag).unwrap());

        bag.insert("email".to_string(), json!("user@other.com"));
        assert!(!match_property(&prop, &bag).unwrap());

        let not_prop = property("email", "not_icontains", json!("@example.com"));
        assert!(match_property(&not_prop, &bag).unwrap());
    }

    #[test]
    fn regex_matches_and_invalid_pattern_is_inconclusive() {
        let prop = property("email", "regex", json!(r".*@company\.com$"));
        let mut bag = Properties::new();
        bag.insert("email".to_string(), json!("user@company.com"));
        assert!(match_property(&prop, &bag).unwrap());

        bag.insert("email".to_string(), json!("user@example.com"));
        assert!(!match_property(&prop, &bag).unwrap());

        let bad = property("email", "regex", json!("(unclosed"));
        assert!(match_property(&bad, &bag).is_err());
        let bad_not = property("email", "not_regex", json!("(unclosed"));
        assert!(match_property(&bad_not, &bag).is_err());
    }

    #[test]
    fn numeric_comparisons_coerce_both_sides() {
        let mut bag = Properties::new();
        bag.insert("age".to_string(), json!(25));
        assert!(match_property(&property("age", "gt", json!(18)), &bag).unwrap());
        assert!(!match_property(&property("age", "gt", json!(30)), &bag).unwrap());
        assert!(match_property(&property("age", "gte", json!(25)), &bag).unwrap());
        assert!(match_property(&property("age", "lte", json!("25")), &bag).unwrap());
        assert!(match_property(&property("age", "lt", json!("26")), &bag).unwrap());

        // String-typed property still compares numerically.
        bag.insert("age".to_string(), json!("9"));
        assert!(match_property(&property("age", "lt", json!(10)), &bag).unwrap());
    }

    #[test]
    fn non_numeric_comparison_falls_back_to_strings() {
        let mut bag = Properties::new();
        bag.insert("version".to_string(), json!("beta"));
        assert!(match_property(&property("version", "gt", json!("alpha")), &bag).unwrap());
        assert!(!match_property(&property("version", "lt", json!("alpha")), &bag).unwrap());
    }

    #[test]
    fn unknown_operator_is_inconclusive() {
        let mut bag = Properties::new();
        bag.insert("status".to_string(), json!("active"));
        let err = match_property(&property("status", "fuzzy", json!("active")), &bag).unwrap_err();
        assert!(err.message.contains("fuzzy"));
    }

    // ==================== Dates ====================

    #[test]
    fn relative_dates_parse_with_all_units() {
        for unit in ["h", "d", "w", "m", "y"] {
            assert!(parse_relative_date(&format!("-3{unit}")).is_some());
        }
        assert!(parse_relative_date("-").is_none());
        assert!(parse_relative_date("-7").is_none());
        assert!(parse_relative_date("-d").is_none());
        assert!(parse_relative_date("-7x").is_none());
        assert!(parse_relative_date("-10001d").is_none(), "cap at 10000");
        assert!(parse_relative_date("10000h").is_some());
    }

    #[test]
    fn is_date_before_with_relative_date() {
        let prop = property("signup_date", "is_date_before", json!("-7d"));
        let mut bag = Properties::new();

        let ten_days_ago = Utc::now() - chrono::Duration::days(10);
        bag.insert(
            "signup_date".to_string(),
            json!(ten_days_ago.format("%Y-%m-%d").to_string()),
        );
        assert!(match_property(&prop, &bag).unwrap());

        let three_days_ago = Utc::now() - chrono::Duration::days(3);
        bag.insert(
            "signup_date".to_string(),
            json!(three_days_ago.format("%Y-%m-%d").to_string()),
        );
        assert!(!match_property(&prop, &bag).unwrap());
    }

    #[test]
    fn is_date_after_with_absolute_dates() {
        let prop = property("start_date", "is_date_after", json!("2024-01-01"));
        let mut bag = Properties::new();
        bag.insert("start_date".to_string(), json!("2024-03-15"));
        assert!(match_property(&prop, &bag).unwrap());
        bag.insert("start_date".to_string(), json!("2023-12-01"));
        assert!(!match_property(&prop, &bag).unwrap());

        // Naive datetime condition values are interpreted as UTC.
        let prop = property("event_time", "is_date_before", json!("2024-06-15T10:30:00"));
        bag.insert("event_time".to_string(), json!("2024-06-15T08:00:00Z"));
        assert!(match_property(&prop, &bag).unwrap());
    }

    #[test]
    fn unix_seconds_properties_parse_as_dates() {
        let prop = property("last_seen", "is_date_after", json!("2024-01-01"));
        let mut bag = Properties::new();
        // 2024-06-01T00:00:00Z
        bag.insert("last_seen".to_string(), json!(1_717_200_000));
        assert!(match_property(&prop, &bag).unwrap());
        // 2020-01-01T00:00:00Z
        bag.insert("last_seen".to_string(), json!(1_577_836_800));
        assert!(!match_property(&prop, &bag).unwrap());
    }

    #[test]
    fn unparseable_dates_are_inconclusive() {
        let prop = property("date", "is_date_before", json!("-7d"));
        let mut bag = Properties::new();
        bag.insert("date".to_string(), json!("not-a-date"));
        assert!(match_property(&prop, &bag).is_err());

        let prop = property("date", "is_date_before", json!("also-not-a-date"));
        bag.insert("date".to_string(), json!("2024-01-01"));
        assert!(match_property(&prop, &bag).is_err());
    }

    // ==================== Condition groups ====================

    #[test]
    fn active_flag_with_full_rollout_matches() {
        let flag = simple_flag("test-flag", Some(100.0));
        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);

        let value = match_flag_conditions(&flag, &ctx).unwrap();
        assert_eq!(value, FlagValue::Boolean(true));
    }

    #[test]
    fn absent_rollout_means_full_rollout() {
        let flag = simple_flag("test-flag", None);
        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert_eq!(
            match_flag_conditions(&flag, &ctx).unwrap(),
            FlagValue::Boolean(true)
        );
    }

    #[test]
    fn flag_without_groups_does_not_match() {
        let mut flag = simple_flag("empty", Some(100.0));
        flag.filters.groups.clear();
        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert_eq!(
            match_flag_conditions(&flag, &ctx).unwrap(),
            FlagValue::Boolean(false)
        );
    }

    #[test]
    fn later_group_can_recover_from_inconclusive_group() {
        let mut flag = simple_flag("recover", Some(100.0));
        flag.filters.groups = vec![
            FlagConditionGroup {
                properties: vec![property("email", "exact", json!("a@b.com"))],
                rollout_percentage: Some(100.0),
            },
            FlagConditionGroup {
                properties: vec![],
                rollout_percentage: Some(100.0),
            },
        ];

        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new(); // no email: first group inconclusive
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert_eq!(
            match_flag_conditions(&flag, &ctx).unwrap(),
            FlagValue::Boolean(true)
        );
    }

    #[test]
    fn inconclusive_group_with_no_match_raises() {
        let mut flag = simple_flag("strict", Some(100.0));
        flag.filters.groups = vec![FlagConditionGroup {
            properties: vec![property("email", "exact", json!("a@b.com"))],
            rollout_percentage: Some(100.0),
        }];

        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(matches!(
            match_flag_conditions(&flag, &ctx),
            Err(FlagError::Inconclusive(_))
        ));
    }

    #[test]
    fn negation_inverts_a_condition() {
        let mut prop = property("plan", "exact", json!("free"));
        prop.negation = Some(true);

        let mut flag = simple_flag("negated", Some(100.0));
        flag.filters.groups = vec![FlagConditionGroup {
            properties: vec![prop],
            rollout_percentage: Some(100.0),
        }];

        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let mut bag = Properties::new();
        bag.insert("plan".to_string(), json!("paid"));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert_eq!(
            match_flag_conditions(&flag, &ctx).unwrap(),
            FlagValue::Boolean(true)
        );
    }

    // ==================== Cohorts ====================

    fn cohort_group(values: Vec<GroupValue>, logic: GroupLogic) -> PropertyGroup {
        PropertyGroup { logic, values }
    }

    #[test]
    fn cohort_condition_resolves_through_the_table() {
        let mut cohorts = HashMap::new();
        cohorts.insert(
            "7".to_string(),
            cohort_group(
                vec![GroupValue::Property(property("country", "exact", json!("US")))],
                GroupLogic::And,
            ),
        );

        let mut cohort_prop = property("id", "exact", json!(7));
        cohort_prop.property_type = Some("cohort".to_string());

        let flags = HashMap::new();
        let mut bag = Properties::new();
        bag.insert("country".to_string(), json!("US"));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(match_condition(&cohort_prop, &ctx).unwrap());

        bag.insert("country".to_string(), json!("UK"));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(!match_condition(&cohort_prop, &ctx).unwrap());
    }

    #[test]
    fn missing_cohort_requires_server_evaluation() {
        let mut cohort_prop = property("id", "exact", json!("99"));
        cohort_prop.property_type = Some("cohort".to_string());

        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(matches!(
            match_condition(&cohort_prop, &ctx),
            Err(FlagError::RequiresServerEvaluation)
        ));
    }

    #[test]
    fn nested_and_or_groups_short_circuit() {
        // OR(country = US, AND(plan = pro, seats > 10))
        let nested = cohort_group(
            vec![
                GroupValue::Property(property("country", "exact", json!("US"))),
                GroupValue::Group(cohort_group(
                    vec![
                        GroupValue::Property(property("plan", "exact", json!("pro"))),
                        GroupValue::Property(property("seats", "gt", json!(10))),
                    ],
                    GroupLogic::And,
                )),
            ],
            GroupLogic::Or,
        );

        let flags = HashMap::new();
        let cohorts = HashMap::new();

        let mut bag = Properties::new();
        bag.insert("country".to_string(), json!("US"));
        let ctx = context(&flags, &cohorts, "u", &bag);
        assert!(match_property_group(&nested, &ctx).unwrap());

        let mut bag = Properties::new();
        bag.insert("country".to_string(), json!("DE"));
        bag.insert("plan".to_string(), json!("pro"));
        bag.insert("seats".to_string(), json!(25));
        let ctx = context(&flags, &cohorts, "u", &bag);
        assert!(match_property_group(&nested, &ctx).unwrap());

        let mut bag = Properties::new();
        bag.insert("country".to_string(), json!("DE"));
        bag.insert("plan".to_string(), json!("free"));
        bag.insert("seats".to_string(), json!(25));
        let ctx = context(&flags, &cohorts, "u", &bag);
        assert!(!match_property_group(&nested, &ctx).unwrap());
    }

    #[test]
    fn empty_group_matches() {
        let group = cohort_group(vec![], GroupLogic::Or);
        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "u", &bag);
        assert!(match_property_group(&group, &ctx).unwrap());
    }

    #[test]
    fn cohort_not_in_operator_inverts_membership() {
        let mut cohorts = HashMap::new();
        cohorts.insert(
            "blocked".to_string(),
            cohort_group(
                vec![GroupValue::Property(property(
                    "status",
                    "exact",
                    json!("blocked"),
                ))],
                GroupLogic::And,
            ),
        );

        let mut prop = property("id", "not_in", json!("blocked"));
        prop.property_type = Some("cohort".to_string());

        let flags = HashMap::new();
        let mut bag = Properties::new();
        bag.insert("status".to_string(), json!("active"));
        let ctx = context(&flags, &cohorts, "u", &bag);
        assert!(match_condition(&prop, &ctx).unwrap());

        bag.insert("status".to_string(), json!("blocked"));
        let ctx = context(&flags, &cohorts, "u", &bag);
        assert!(!match_condition(&prop, &ctx).unwrap());
    }

    // ==================== Flag dependencies ====================

    fn dependency_prop(key: &str, expected: Value, chain: Option<Vec<&str>>) -> FlagProperty {
        FlagProperty {
            key: key.to_string(),
            value: expected,
            operator: "flag_evaluates_to".to_string(),
            negation: None,
            property_type: Some("flag".to_string()),
            dependency_chain: chain.map(|c| c.into_iter().map(String::from).collect()),
        }
    }

    #[test]
    fn dependency_on_enabled_flag_matches_true() {
        let mut flags = HashMap::new();
        flags.insert("base".to_string(), simple_flag("base", Some(100.0)));

        let prop = dependency_prop("base", json!(true), Some(vec!["base"]));
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(match_condition(&prop, &ctx).unwrap());
        // The resolved value lands in the per-call cache.
        assert_eq!(
            ctx.evaluation_cache.borrow().get("base"),
            Some(&FlagValue::Boolean(true))
        );
    }

    #[test]
    fn dependency_on_inactive_flag_resolves_false() {
        let mut inactive = simple_flag("base", Some(100.0));
        inactive.active = false;
        let mut flags = HashMap::new();
        flags.insert("base".to_string(), inactive);

        let cohorts = HashMap::new();
        let bag = Properties::new();

        let prop = dependency_prop("base", json!(false), Some(vec!["base"]));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(match_condition(&prop, &ctx).unwrap());

        let prop = dependency_prop("base", json!(true), Some(vec!["base"]));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(!match_condition(&prop, &ctx).unwrap());
    }

    #[test]
    fn dependency_on_variant_matches_case_sensitively() {
        let mut variant_flag = simple_flag("exp", Some(100.0));
        variant_flag.filters.multivariate = Some(Multivariate {
            variants: vec![Variant {
                key: "test".to_string(),
                rollout_percentage: 100.0,
            }],
        });
        let mut flags = HashMap::new();
        flags.insert("exp".to_string(), variant_flag);

        let cohorts = HashMap::new();
        let bag = Properties::new();

        let prop = dependency_prop("exp", json!("test"), Some(vec!["exp"]));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(match_condition(&prop, &ctx).unwrap());

        let prop = dependency_prop("exp", json!("TEST"), Some(vec!["exp"]));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(!match_condition(&prop, &ctx).unwrap());

        // A variant also satisfies an expected boolean true.
        let prop = dependency_prop("exp", json!(true), Some(vec!["exp"]));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(match_condition(&prop, &ctx).unwrap());
    }

    #[test]
    fn empty_dependency_chain_is_circular_and_inconclusive() {
        let mut flags = HashMap::new();
        flags.insert("a".to_string(), simple_flag("a", Some(100.0)));

        let prop = dependency_prop("a", json!(true), Some(vec![]));
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        match match_condition(&prop, &ctx) {
            Err(FlagError::Inconclusive(e)) => assert!(e.message.contains("circular")),
            other => panic!("expected inconclusive, got {other:?}"),
        }
    }

    #[test]
    fn missing_dependency_is_inconclusive() {
        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let prop = dependency_prop("ghost", json!(true), Some(vec!["ghost"]));
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(matches!(
            match_condition(&prop, &ctx),
            Err(FlagError::Inconclusive(_))
        ));
    }

    #[test]
    fn unsupported_dependency_operator_is_inconclusive() {
        let mut prop = dependency_prop("a", json!(true), Some(vec!["a"]));
        prop.operator = "exact".to_string();

        let flags = HashMap::new();
        let cohorts = HashMap::new();
        let bag = Properties::new();
        let ctx = context(&flags, &cohorts, "user-123", &bag);
        assert!(matches!(
            match_condition(&prop, &ctx),
            Err(FlagError::Inconclusive(_))
        ));
    }

    #[test]
    fn flag_evaluates_to_truth_table() {
        assert!(flag_evaluates_to(&FlagValue::Boolean(true), &json!(true)));
        assert!(flag_evaluates_to(
            &FlagValue::String("test".into()),
            &json!(true)
        ));
        assert!(flag_evaluates_to(&FlagValue::Boolean(false), &json!(false)));
        assert!(flag_evaluates_to(
            &FlagValue::String("test".into()),
            &json!("test")
        ));
        assert!(!flag_evaluates_to(
            &FlagValue::String("test".into()),
            &json!("Test")
        ));
        assert!(!flag_evaluates_to(&FlagValue::Boolean(true), &json!(false)));
        assert!(!flag_evaluates_to(
            &FlagValue::Boolean(false),
            &json!(true)
        ));
        assert!(!flag_evaluates_to(
            &FlagValue::Boolean(true),
            &json!("test")
        ));
    }

    // ==================== Definition parsing ====================

    #[test]
    fn flag_definitions_deserialize_from_api_shape() {
        let flag: FeatureFlag = serde_json::from_value(json!({
            "key": "checkout",
            "id": 42,
            "version": 3,
            "active": true,
            "ensure_experience_continuity": false,
            "filters": {
                "groups": [
                    {"properties": [{"key": "email", "value": "@corp.com", "operator": "icontains"}],
                     "rollout_percentage": 50.0}
                ],
                "multivariate": {"variants": [{"key": "control", "rollout_percentage": 100.0}]},
                "payloads": {"control": "{\"color\": \"blue\"}"},
                "aggregation_group_type_index": null
            }
        }))
        .unwrap();

        assert_eq!(flag.key, "checkout");
        assert_eq!(flag.id, Some(42));
        assert_eq!(flag.filters.groups.len(), 1);
        assert_eq!(flag.filters.groups[0].properties[0].operator, "icontains");
    }

    #[test]
    fn property_groups_deserialize_nested_and_leaf_values() {
        let group: PropertyGroup = serde_json::from_value(json!({
            "type": "OR",
            "values": [
                {"type": "AND", "values": [
                    {"key": "country", "value": "US", "operator": "exact", "type": "person"}
                ]},
                {"key": "id", "value": 7, "operator": "exact", "type": "cohort"}
            ]
        }))
        .unwrap();

        assert_eq!(group.logic, GroupLogic::Or);
        assert_eq!(group.values.len(), 2);
        assert!(matches!(group.values[0], GroupValue::Group(_)));
        match &group.values[1] {
            GroupValue::Property(p) => {
                assert_eq!(p.property_type.as_deref(), Some("cohort"));
            }
            other => panic!("expected property leaf, got {other:?}"),
        }
    }
}
