//! Kubespout core types – descriptors, lifecycle notifications and the
//! canonical event envelope shared by all crates.

#![forbid(unsafe_code)]

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content type used when POSTing a [`CanonicalEvent`] to the sink.
pub const CONTENT_TYPE_CLOUDEVENTS_JSON: &str = "application/cloudevents+json";

/// Errors raised while assembling the watched-descriptor set.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("parallel config lists must have equal length: {api_versions} apiVersions, {kinds} kinds, {controllers} controller flags")]
    LengthMismatch {
        api_versions: usize,
        kinds: usize,
        controllers: usize,
    },
    #[error("invalid apiVersion {0:?} (expect \"version\" or \"group/version\")")]
    InvalidApiVersion(String),
}

/// One watched resource kind, fixed at process start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Whether the adapter reflects owner-controller semantics for this kind
    /// instead of observing the objects themselves.
    pub is_controller: bool,
}

impl ResourceDescriptor {
    /// Parse an `apiVersion` string ("v1" or "group/version") plus kind.
    pub fn parse(api_version: &str, kind: &str, is_controller: bool) -> Result<Self, DescriptorError> {
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) if !g.is_empty() && !v.is_empty() && !v.contains('/') => {
                (g.to_string(), v.to_string())
            }
            None if !api_version.is_empty() => (String::new(), api_version.to_string()),
            _ => return Err(DescriptorError::InvalidApiVersion(api_version.to_string())),
        };
        Ok(Self { group, version, kind: kind.to_string(), is_controller })
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// The `apiVersion` form ("v1" or "group/version").
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Group segment used in event types; the empty core group renders as "core".
    pub fn group_or_core(&self) -> &str {
        if self.group.is_empty() { "core" } else { &self.group }
    }

    /// Lowercase plural resource name guessed from the kind, mirroring the
    /// apiserver's kind-to-resource convention.
    pub fn resource_plural(&self) -> String {
        let lower = self.kind.to_lowercase();
        if let Some(stem) = lower.strip_suffix('y') {
            format!("{stem}ies")
        } else if lower.ends_with('s') {
            format!("{lower}es")
        } else {
            format!("{lower}s")
        }
    }
}

/// Build the full descriptor set from the parallel ordered config lists.
/// A length mismatch is a fatal configuration error.
pub fn build_descriptors(
    api_versions: &[String],
    kinds: &[String],
    controllers: &[bool],
) -> Result<Vec<Arc<ResourceDescriptor>>, DescriptorError> {
    if api_versions.len() != kinds.len() || kinds.len() != controllers.len() {
        return Err(DescriptorError::LengthMismatch {
            api_versions: api_versions.len(),
            kinds: kinds.len(),
            controllers: controllers.len(),
        });
    }
    api_versions
        .iter()
        .zip(kinds)
        .zip(controllers)
        .map(|((av, kind), ctl)| ResourceDescriptor::parse(av, kind, *ctl).map(Arc::new))
        .collect()
}

/// What the data payload of a translated event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Full object snapshot.
    Resource,
    /// Object reference only.
    Ref,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mode {0:?} (expect \"Resource\" or \"Ref\")")]
pub struct InvalidMode(String);

impl FromStr for Mode {
    type Err = InvalidMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Resource" | "resource" => Ok(Mode::Resource),
            "Ref" | "ref" => Ok(Mode::Ref),
            other => Err(InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LifecycleKind {
    Added,
    Updated,
    Deleted,
}

impl LifecycleKind {
    /// Verb segment used in event types and ids.
    pub fn verb(&self) -> &'static str {
        match self {
            LifecycleKind::Added => "add",
            LifecycleKind::Updated => "update",
            LifecycleKind::Deleted => "delete",
        }
    }
}

/// One observed lifecycle change, produced by a watch source and consumed
/// exactly once by the translator.
#[derive(Debug, Clone)]
pub struct LifecycleNotification {
    pub kind: LifecycleKind,
    /// Raw object as observed (schema-less).
    pub resource: serde_json::Value,
    pub descriptor: Arc<ResourceDescriptor>,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    pub timestamp: DateTime<Utc>,
}

/// Uniform envelope delivered to the sink.
///
/// `id` is unique per (namespace, kind, name, verb, resourceVersion) tuple for
/// the adapter's lifetime, so the sink can deduplicate redeliveries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalEvent {
    pub specversion: String,
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub source: String,
    pub subject: String,
    #[serde(with = "rfc3339")]
    pub time: DateTime<Utc>,
    pub datacontenttype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Marker set when the resource payload could not be rendered; the event
    /// still flows with an empty data payload.
    #[serde(rename = "translationerror", skip_serializing_if = "Option::is_none")]
    pub translation_error: Option<String>,
}

pub mod rfc3339 {
    //! RFC 3339 rendering for event timestamps (stable across serializations).

    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// Metrics-only result tag; never drives control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

/// What a delivery attempt produced, shaped for metric tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub outcome: Outcome,
    /// Absent when the failure was transport-level (no response observed).
    pub response_code: Option<u16>,
}

impl DeliveryOutcome {
    pub fn success(code: u16) -> Self {
        Self { outcome: Outcome::Success, response_code: Some(code) }
    }

    pub fn rejected(code: u16) -> Self {
        Self { outcome: Outcome::Failure, response_code: Some(code) }
    }

    pub fn transport_failure() -> Self {
        Self { outcome: Outcome::Failure, response_code: None }
    }

    /// Numeric response code tag value, empty when no response was observed.
    pub fn code_tag(&self) -> String {
        self.response_code.map(|c| c.to_string()).unwrap_or_default()
    }

    /// Response class tag value ("2xx", "5xx", ...), empty when no response.
    pub fn class_tag(&self) -> String {
        self.response_code.map(response_code_class).unwrap_or_default()
    }
}

/// Render an HTTP status code as its class string, e.g. 202 -> "2xx".
pub fn response_code_class(code: u16) -> String {
    format!("{}xx", code / 100)
}
