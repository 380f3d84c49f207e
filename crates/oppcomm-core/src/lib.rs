//! Opportunity domain model and commission reconciliation rules.
//!
//! Everything in this crate is pure: records come in already fetched, decisions
//! and write payloads go out. Remote I/O lives in `oppcomm-client`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "oppcomm-core";

/// Stored and computed values closer than this are considered equal.
pub const UPDATE_TOLERANCE: f64 = 0.01;

/// Tenant-defined attribute attached to an opportunity.
///
/// Tenants populate any subset of `id`/`key`/`name`, and `value` may be a
/// number, a currency-formatted string or missing entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CustomField {
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, deserialize_with = "lenient_text", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

/// Opportunity record as returned by the CRM.
///
/// Only the fields the reconciler reasons about are typed. Display-name fields
/// arrive under several spellings depending on the API surface, so they stay
/// in `extra` and are resolved by [`resolve_contact_name`] and
/// [`resolve_title`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monetary_value: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "pipelineStageId", skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    pub custom_fields: Vec<CustomField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

const PIPELINE_ID_KEYS: &[&str] = &["pipelineId", "pipeline_id"];
const MONETARY_VALUE_KEYS: &[&str] = &["monetaryValue", "monetary_value"];
const STAGE_ID_KEYS: &[&str] = &["pipelineStageId", "stageId", "stage_id"];
const CUSTOM_FIELDS_KEYS: &[&str] = &["customFields", "custom_fields"];

impl Opportunity {
    /// Stored monetary value; missing, null or unparseable values read as `None`.
    pub fn current_value(&self) -> Option<f64> {
        self.monetary_value.as_ref().and_then(parse_amount)
    }
}

/// Remove every spelling in `keys` from `map` and keep the first non-null one.
fn take_first(map: &mut Map<String, JsonValue>, keys: &[&str]) -> Option<JsonValue> {
    keys.iter()
        .filter_map(|key| map.remove(*key))
        .fold(None, |found, value| found.or(Some(value).filter(|v| !v.is_null())))
}

fn text_value(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TryFrom<Map<String, JsonValue>> for Opportunity {
    type Error = String;

    fn try_from(mut map: Map<String, JsonValue>) -> Result<Self, Self::Error> {
        let id = map
            .remove("id")
            .and_then(text_value)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| "opportunity record has no id".to_string())?;
        let custom_fields = match take_first(&mut map, CUSTOM_FIELDS_KEYS) {
            Some(fields) => serde_json::from_value(fields)
                .map_err(|err| format!("customFields on opportunity {id}: {err}"))?,
            None => Vec::new(),
        };
        Ok(Self {
            pipeline_id: take_first(&mut map, PIPELINE_ID_KEYS).and_then(text_value),
            monetary_value: take_first(&mut map, MONETARY_VALUE_KEYS),
            status: map.remove("status").and_then(text_value),
            stage_id: take_first(&mut map, STAGE_ID_KEYS).and_then(text_value),
            contact: map.remove("contact").filter(|c| !c.is_null()),
            custom_fields,
            id,
            extra: map,
        })
    }
}

impl<'de> Deserialize<'de> for Opportunity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map = Map::<String, JsonValue>::deserialize(deserializer)?;
        Self::try_from(map).map_err(serde::de::Error::custom)
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<JsonValue>::deserialize(deserializer)?.and_then(text_value))
}

/// Parse a monetary value that is either a JSON number or currency text.
pub fn parse_amount(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        JsonValue::String(s) => parse_amount_text(s),
        _ => None,
    }
}

/// Strip `$`, `,` and surrounding whitespace, then parse as a decimal number.
pub fn parse_amount_text(text: &str) -> Option<f64> {
    let cleaned: String = text.chars().filter(|c| !matches!(c, '$' | ',')).collect();
    cleaned
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Lower-case, map spaces and slashes to `_`, collapse underscore runs.
pub fn normalize_field_name(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.trim().chars().flat_map(char::to_lowercase) {
        let ch = if ch == ' ' || ch == '/' { '_' } else { ch };
        if ch == '_' && out.ends_with('_') {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Which rule of the key matching policy accepted a custom field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch {
    Id,
    Key,
    Name,
    CompactName,
}

/// Configured target field identifier with its normalized forms precomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldKey {
    raw: String,
    normalized: String,
    compact: String,
}

impl FieldKey {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let normalized = normalize_field_name(&raw);
        let compact = normalized.replace('_', "");
        Self {
            raw,
            normalized,
            compact,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, field: &CustomField) -> Option<KeyMatch> {
        if field.id.as_deref() == Some(self.raw.as_str()) {
            return Some(KeyMatch::Id);
        }
        if field.key.as_deref() == Some(self.raw.as_str()) {
            return Some(KeyMatch::Key);
        }
        let name = normalize_field_name(field.name.as_deref()?);
        if name.is_empty() {
            return None;
        }
        if name == self.normalized {
            return Some(KeyMatch::Name);
        }
        if name.replace('_', "") == self.compact {
            return Some(KeyMatch::CompactName);
        }
        None
    }
}

fn describe_fields(fields: &[CustomField]) -> String {
    let described: Vec<String> = fields
        .iter()
        .map(|f| {
            format!(
                "(name={:?}, id={:?}, key={:?})",
                f.name.as_deref().unwrap_or(""),
                f.id.as_deref().unwrap_or(""),
                f.key.as_deref().unwrap_or("")
            )
        })
        .collect();
    format!("[{}]", described.join(", "))
}

/// Locate the loan amount among `fields`; the first matching field with a
/// value wins.
///
/// A matched field whose value is missing or null is passed over. A matched
/// value that does not parse ends the search as not-found. A miss logs every
/// field's name/id/key so an operator can pick the right key without querying
/// the API again.
pub fn extract_amount(fields: &[CustomField], target: &FieldKey) -> Option<f64> {
    for field in fields {
        let Some(rule) = target.matches(field) else {
            continue;
        };
        let Some(value) = field.value.as_ref().filter(|v| !v.is_null()) else {
            debug!(target_key = target.as_str(), ?rule, "matched loan amount field has no value");
            continue;
        };
        debug!(target_key = target.as_str(), ?rule, "matched loan amount field");
        let amount = parse_amount(value);
        if amount.is_none() {
            warn!(
                target_key = target.as_str(),
                %value,
                "loan amount field matched but its value is not numeric"
            );
        }
        return amount;
    }

    warn!(
        target_key = target.as_str(),
        available = %describe_fields(fields),
        "loan amount field not found"
    );
    None
}

/// `round(amount * rate, 2)`, half away from zero.
pub fn calculate_commission(amount: f64, rate: f64) -> f64 {
    (amount * rate * 100.0).round() / 100.0
}

/// A missing stored value counts as zero.
pub fn needs_update(current: Option<f64>, target: f64) -> bool {
    (current.unwrap_or(0.0) - target).abs() > UPDATE_TOLERANCE
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoLoanAmount,
    NonPositive(f64),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoLoanAmount => write!(f, "no valid loan amount found"),
            SkipReason::NonPositive(amount) => {
                write!(f, "loan amount {amount} is not positive")
            }
        }
    }
}

/// Decision for one record.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Skipped(SkipReason),
    AlreadyCorrect { loan_amount: f64, target: f64 },
    NeedsUpdate { loan_amount: f64, target: f64 },
}

/// Process-wide commission settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CommissionPolicy {
    pub rate: f64,
    pub field_key: FieldKey,
}

impl CommissionPolicy {
    pub fn new(rate: f64, field_key: impl Into<String>) -> Self {
        Self {
            rate,
            field_key: FieldKey::new(field_key),
        }
    }

    pub fn extract_amount(&self, opportunity: &Opportunity) -> Option<f64> {
        extract_amount(&opportunity.custom_fields, &self.field_key)
    }

    /// Decide what to do with `opportunity`.
    ///
    /// A positive `override_amount` (number or currency text) replaces field
    /// extraction entirely; anything else falls back to the record's fields.
    pub fn reconcile(&self, opportunity: &Opportunity, override_amount: Option<&JsonValue>) -> Outcome {
        let from_override = override_amount
            .and_then(parse_amount)
            .filter(|amount| *amount > 0.0);
        let loan_amount = match from_override {
            Some(amount) => {
                debug!(opportunity_id = %opportunity.id, amount, "using loan amount from event payload");
                Some(amount)
            }
            None => self.extract_amount(opportunity),
        };

        let Some(loan_amount) = loan_amount else {
            return Outcome::Skipped(SkipReason::NoLoanAmount);
        };
        if loan_amount <= 0.0 {
            return Outcome::Skipped(SkipReason::NonPositive(loan_amount));
        }

        let target = calculate_commission(loan_amount, self.rate);
        if needs_update(opportunity.current_value(), target) {
            Outcome::NeedsUpdate { loan_amount, target }
        } else {
            Outcome::AlreadyCorrect { loan_amount, target }
        }
    }
}

/// Full-replace body for the per-record update endpoint.
///
/// The address (`pipeline_id`, `opportunity_id`) travels with the body but is
/// not serialized into it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdatePayload {
    #[serde(skip)]
    pub pipeline_id: String,
    #[serde(skip)]
    pub opportunity_id: String,
    #[serde(rename = "monetaryValue")]
    pub monetary_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(rename = "pipelineStageId", skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opportunity_name: Option<String>,
}

fn first_text<'a>(map: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| map.get(*key)?.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn join_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let joined = format!("{} {}", first.unwrap_or(""), last.unwrap_or(""));
    let joined = joined.trim();
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_string())
    }
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty()).cloned()
}

/// Contact display name: nested full name, nested first/last, root full
/// name, root first/last.
pub fn resolve_contact_name(opportunity: &Opportunity) -> Option<String> {
    if let Some(contact) = opportunity.contact.as_ref().and_then(JsonValue::as_object) {
        if let Some(name) = first_text(contact, &["name", "full_name", "fullName"]) {
            return Some(name.to_string());
        }
        let first = first_text(contact, &["firstName", "first_name"]);
        let last = first_text(contact, &["lastName", "last_name"]);
        if let Some(name) = join_name(first, last) {
            return Some(name);
        }
    }

    let root = &opportunity.extra;
    if let Some(name) = first_text(root, &["contact_name", "full_name", "fullName"]) {
        return Some(name.to_string());
    }
    join_name(
        first_text(root, &["first_name", "firstName"]),
        first_text(root, &["last_name", "lastName"]),
    )
}

/// Opportunity title: `opportunity_name`, then `title`, then `name`.
pub fn resolve_title(opportunity: &Opportunity) -> Option<String> {
    first_text(&opportunity.extra, &["opportunity_name", "title", "name"]).map(str::to_string)
}

/// Build the write-back body for `target`.
///
/// With an existing record, status and stage are copied through verbatim and
/// display names are reconstructed so the full replace does not blank them.
/// A missing contact name degrades to the opportunity title rather than
/// failing the write.
pub fn build_update_payload(
    pipeline_id: &str,
    opportunity_id: &str,
    target: f64,
    existing: Option<&Opportunity>,
) -> UpdatePayload {
    let mut payload = UpdatePayload {
        pipeline_id: pipeline_id.to_string(),
        opportunity_id: opportunity_id.to_string(),
        monetary_value: target,
        status: None,
        stage_id: None,
        name: None,
        title: None,
        opportunity_name: None,
    };

    let Some(existing) = existing else {
        return payload;
    };

    payload.status = non_blank(existing.status.as_ref());
    payload.stage_id = non_blank(existing.stage_id.as_ref());

    let contact_name = resolve_contact_name(existing);
    let title = resolve_title(existing);
    info!(
        opportunity_id,
        contact = ?contact_name,
        title = ?title,
        "resolved display names for update payload"
    );

    payload.name = match contact_name {
        Some(name) => Some(name),
        None => {
            warn!(
                opportunity_id,
                "no contact name on record; sending opportunity title as name"
            );
            title.clone()
        }
    };
    payload.opportunity_name = title.clone();
    payload.title = title;
    payload
}
