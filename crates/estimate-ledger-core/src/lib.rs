use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

/// Joins the semantic fields of a record that has no persistent id.
pub const IDENTITY_SEPARATOR: &str = "|";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
}

/// A JSON scalar the backend stores without a fixed type (`10`, `"10"`, `true`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum LooseValue {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl LooseValue {
    /// String form used for identity keys and key matching.
    #[must_use]
    pub fn coerce(&self) -> String {
        match self {
            Self::Text(value) => value.clone(),
            Self::Number(value) => coerce_number(value),
            Self::Flag(value) => value.to_string(),
        }
    }

    fn is_blank(&self) -> bool {
        matches!(self, Self::Text(value) if value.trim().is_empty())
    }

    fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(value) => Some(Self::Text(value)),
            serde_json::Value::Number(value) => Some(Self::Number(value)),
            serde_json::Value::Bool(value) => Some(Self::Flag(value)),
            _ => None,
        }
    }
}

impl From<&str> for LooseValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for LooseValue {
    fn from(value: i64) -> Self {
        Self::Number(serde_json::Number::from(value))
    }
}

fn coerce_number(value: &serde_json::Number) -> String {
    if let Some(integer) = value.as_i64() {
        return integer.to_string();
    }
    if let Some(integer) = value.as_u64() {
        return integer.to_string();
    }
    // f64 Display drops a zero fraction, so 10.0 renders as "10".
    value.as_f64().map_or_else(|| value.to_string(), |float| float.to_string())
}

// Backend fields are untyped: any scalar is accepted and non-scalars read as absent.
fn lenient_scalar<'de, D>(deserializer: D) -> Result<Option<LooseValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(LooseValue::from_json))
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_scalar(deserializer)?.map(|value| match value {
        LooseValue::Text(text) => text,
        other => other.coerce(),
    }))
}

/// `null` reads as no tags; a bare scalar reads as a single tag.
fn lenient_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let tags = match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(LooseValue::from_json)
            .map(|tag| tag.coerce())
            .collect(),
        Some(other) => LooseValue::from_json(other).map(|tag| tag.coerce()).into_iter().collect(),
        None => Vec::new(),
    };
    Ok(tags)
}

fn coerce_optional(value: Option<&LooseValue>) -> String {
    value.map(LooseValue::coerce).unwrap_or_default()
}

fn text_or_empty(value: Option<&String>) -> String {
    value.cloned().unwrap_or_default()
}

fn is_blank_text(value: Option<&str>) -> bool {
    value.map(str::trim).unwrap_or_default().is_empty()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Receipt,
    BillingTicket,
}

impl RecordKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Receipt => "receipt",
            Self::BillingTicket => "billing_ticket",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "receipt" | "receipts" => Some(Self::Receipt),
            "billing_ticket" | "billing_tickets" | "billing-tickets" => Some(Self::BillingTicket),
            _ => None,
        }
    }

    /// Semantic fields joined into the fallback identity, in order.
    #[must_use]
    pub fn identity_field_names(self) -> &'static [&'static str] {
        match self {
            Self::Receipt => &["vendor", "amount", "date", "remarks"],
            Self::BillingTicket => &["date", "lumpSum", "billingTerms"],
        }
    }
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A child record attached to one revision of an estimate.
pub trait VersionedRecord: Clone {
    const KIND: RecordKind;

    /// Persistent identifier, when the backend assigned one.
    fn record_id(&self) -> Option<String>;

    /// Values of [`RecordKind::identity_field_names`], coerced to strings.
    fn identity_fields(&self) -> Vec<String>;

    fn owner(&self) -> Option<&str>;

    fn tags(&self) -> &[String];

    fn occurred_at(&self) -> Option<&str>;

    /// The array of this record type inside one estimate revision.
    fn collection(version: &EstimateVersion) -> &[Option<Self>];

    /// Required-field checks run before a record is submitted.
    ///
    /// # Errors
    /// Returns [`LedgerError::Validation`] naming the first missing field.
    fn validate_for_submit(&self) -> Result<(), LedgerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    #[serde(
        default,
        deserialize_with = "lenient_scalar",
        alias = "_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<LooseValue>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, deserialize_with = "lenient_scalar", skip_serializing_if = "Option::is_none")]
    pub amount: Option<LooseValue>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        alias = "ownerEmail",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_tags", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl VersionedRecord for Receipt {
    const KIND: RecordKind = RecordKind::Receipt;

    fn record_id(&self) -> Option<String> {
        self.id.as_ref().map(LooseValue::coerce)
    }

    fn identity_fields(&self) -> Vec<String> {
        vec![
            text_or_empty(self.vendor.as_ref()),
            coerce_optional(self.amount.as_ref()),
            text_or_empty(self.date.as_ref()),
            text_or_empty(self.remarks.as_ref()),
        ]
    }

    fn owner(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn occurred_at(&self) -> Option<&str> {
        self.date.as_deref()
    }

    fn collection(version: &EstimateVersion) -> &[Option<Self>] {
        version.receipts.as_deref().unwrap_or(&[])
    }

    fn validate_for_submit(&self) -> Result<(), LedgerError> {
        if is_blank_text(self.vendor.as_deref()) {
            return Err(LedgerError::Validation("receipt vendor MUST be provided".to_string()));
        }

        match &self.amount {
            Some(amount) if !amount.is_blank() => Ok(()),
            _ => Err(LedgerError::Validation("receipt amount MUST be provided".to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BillingTicket {
    #[serde(
        default,
        deserialize_with = "lenient_scalar",
        alias = "_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<LooseValue>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_scalar", skip_serializing_if = "Option::is_none")]
    pub lump_sum: Option<LooseValue>,
    #[serde(default, deserialize_with = "lenient_scalar", skip_serializing_if = "Option::is_none")]
    pub billing_terms: Option<LooseValue>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        alias = "ownerEmail",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_by: Option<String>,
    #[serde(default, deserialize_with = "lenient_tags", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl VersionedRecord for BillingTicket {
    const KIND: RecordKind = RecordKind::BillingTicket;

    fn record_id(&self) -> Option<String> {
        self.id.as_ref().map(LooseValue::coerce)
    }

    fn identity_fields(&self) -> Vec<String> {
        vec![
            text_or_empty(self.date.as_ref()),
            coerce_optional(self.lump_sum.as_ref()),
            coerce_optional(self.billing_terms.as_ref()),
        ]
    }

    fn owner(&self) -> Option<&str> {
        self.created_by.as_deref()
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    fn occurred_at(&self) -> Option<&str> {
        self.date.as_deref()
    }

    fn collection(version: &EstimateVersion) -> &[Option<Self>] {
        version.billing_tickets.as_deref().unwrap_or(&[])
    }

    fn validate_for_submit(&self) -> Result<(), LedgerError> {
        if is_blank_text(self.date.as_deref()) {
            return Err(LedgerError::Validation(
                "billing ticket date MUST be provided".to_string(),
            ));
        }

        Ok(())
    }
}

/// One persisted revision of an estimate and the child records saved with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct EstimateVersion {
    #[serde(default, deserialize_with = "lenient_scalar")]
    pub estimate_number: Option<LooseValue>,
    #[serde(default, deserialize_with = "lenient_scalar", skip_serializing_if = "Option::is_none")]
    pub revision: Option<LooseValue>,
    #[serde(default)]
    pub receipts: Option<Vec<Option<Receipt>>>,
    #[serde(default)]
    pub billing_tickets: Option<Vec<Option<BillingTicket>>>,
}

/// Estimate number shared by every revision of one estimate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct ParentKey(String);

impl ParentKey {
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_string())
    }

    #[must_use]
    pub fn from_value(value: &LooseValue) -> Self {
        Self::new(&value.coerce())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }

    /// Trimmed string comparison, so `1042` and `" 1042 "` name the same estimate.
    #[must_use]
    pub fn matches(&self, candidate: Option<&LooseValue>) -> bool {
        candidate.is_some_and(|value| value.coerce().trim() == self.0)
    }
}

impl Display for ParentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordIdentity {
    Id(String),
    Fallback(String),
}

impl RecordIdentity {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Id(value) | Self::Fallback(value) => value,
        }
    }
}

/// Resolve the dedupe identity of one record: its id when non-empty, else its joined fields.
#[must_use]
pub fn resolve_identity<R: VersionedRecord>(record: &R) -> RecordIdentity {
    match record.record_id() {
        Some(id) if !id.trim().is_empty() => RecordIdentity::Id(id),
        _ => RecordIdentity::Fallback(record.identity_fields().join(IDENTITY_SEPARATOR)),
    }
}

/// Flatten `sources` into one list keeping the first record seen for each identity.
///
/// Sources are consumed in order, so the draft passed first wins over older revisions.
/// `None` slots are skipped.
#[must_use]
pub fn merge_versions<'a, R, I>(sources: I) -> Vec<R>
where
    R: VersionedRecord + 'a,
    I: IntoIterator<Item = &'a [Option<R>]>,
{
    let mut seen_ids = BTreeSet::new();
    let mut seen_keys = BTreeSet::new();
    let mut merged = Vec::new();

    for source in sources {
        for record in source.iter().flatten() {
            let first_seen = match resolve_identity(record) {
                RecordIdentity::Id(id) => seen_ids.insert(id),
                RecordIdentity::Fallback(key) => seen_keys.insert(key),
            };
            if first_seen {
                merged.push(record.clone());
            }
        }
    }

    merged
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
pub enum Scope {
    #[default]
    #[serde(rename = "self")]
    SelfOnly,
    #[serde(rename = "all")]
    All,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SelfOnly => "self",
            Self::All => "all",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "self" => Some(Self::SelfOnly),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CallerIdentity {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ScopePolicy {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub caller: CallerIdentity,
    #[serde(default)]
    pub privileged: bool,
}

impl ScopePolicy {
    #[must_use]
    pub fn all() -> Self {
        Self {
            scope: Scope::All,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn self_only(email: Option<&str>, id: Option<&str>) -> Self {
        Self {
            scope: Scope::SelfOnly,
            caller: CallerIdentity {
                email: email.map(str::to_string),
                id: id.map(str::to_string),
            },
            privileged: false,
        }
    }

    /// Whether the caller may see `record` under this policy.
    #[must_use]
    pub fn permits<R: VersionedRecord>(&self, record: &R) -> bool {
        if self.privileged || self.scope == Scope::All {
            return true;
        }

        let email = self
            .caller
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .map(str::to_lowercase);
        let id = self.caller.id.as_deref().filter(|id| !id.trim().is_empty());

        if let (Some(email), Some(owner)) = (email.as_deref(), record.owner()) {
            if owner.trim().to_lowercase() == email {
                return true;
            }
        }

        record.tags().iter().any(|tag| {
            email.as_deref().is_some_and(|email| tag.trim().to_lowercase() == email)
                || id.is_some_and(|id| tag == id)
        })
    }
}

#[must_use]
pub fn filter_by_scope<R: VersionedRecord>(records: Vec<R>, policy: &ScopePolicy) -> Vec<R> {
    if policy.privileged || policy.scope == Scope::All {
        return records;
    }
    records.into_iter().filter(|record| policy.permits(record)).collect()
}

/// Parse a record date; missing or unparsable values map to the Unix epoch.
#[must_use]
pub fn parse_occurred_at(raw: Option<&str>) -> OffsetDateTime {
    raw.map(str::trim).and_then(parse_date).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn parse_date(raw: &str) -> Option<OffsetDateTime> {
    if raw.is_empty() {
        return None;
    }

    if let Ok(value) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(value);
    }

    // Local date-times without an offset are read as UTC.
    let local_forms = [
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day]T[hour]:[minute]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
        format_description!("[year]-[month]-[day] [hour]:[minute]"),
    ];
    if let Some(value) = local_forms
        .into_iter()
        .find_map(|description| PrimitiveDateTime::parse(raw, description).ok())
    {
        return Some(value.assume_utc());
    }

    Date::parse(raw, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|date| date.midnight().assume_utc())
}

/// Order records newest first. Equal timestamps keep their relative order.
pub fn sort_by_recency<R: VersionedRecord>(records: &mut [R]) {
    records.sort_by_cached_key(|record| Reverse(parse_occurred_at(record.occurred_at())));
}

/// Revisions whose estimate number matches `parent_key`, in fetch order.
#[must_use]
pub fn matching_versions<'a>(
    versions: &'a [EstimateVersion],
    parent_key: &ParentKey,
) -> Vec<&'a EstimateVersion> {
    versions.iter().filter(|version| parent_key.matches(version.estimate_number.as_ref())).collect()
}

/// Merge the draft with every matching revision, apply `policy`, and sort newest first.
#[must_use]
pub fn aggregate<R: VersionedRecord>(
    draft: &[Option<R>],
    versions: &[EstimateVersion],
    parent_key: &ParentKey,
    policy: &ScopePolicy,
) -> Vec<R> {
    let matching = matching_versions(versions, parent_key);
    let sources = std::iter::once(draft).chain(matching.into_iter().map(R::collection));
    let merged = merge_versions(sources);
    let mut visible = filter_by_scope(merged, policy);
    sort_by_recency(&mut visible);
    visible
}

/// Decode a backend `result` array into estimate revisions.
///
/// # Errors
/// Returns [`LedgerError::Decode`] when `value` is not an array of estimate objects.
pub fn decode_versions(value: serde_json::Value) -> Result<Vec<EstimateVersion>, LedgerError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value)
        .map_err(|err| LedgerError::Decode(format!("invalid estimate versions: {err}")))
}

/// Decode a JSON array of child records, keeping `null` slots as `None`.
///
/// # Errors
/// Returns [`LedgerError::Decode`] when `value` is not an array of records.
pub fn decode_records<R: DeserializeOwned>(
    value: serde_json::Value,
) -> Result<Vec<Option<R>>, LedgerError> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value)
        .map_err(|err| LedgerError::Decode(format!("invalid record array: {err}")))
}
