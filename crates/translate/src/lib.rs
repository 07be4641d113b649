//! Pure translation from lifecycle notifications to canonical events.

#![forbid(unsafe_code)]

use kubespout_core::{
    CanonicalEvent, LifecycleKind, LifecycleNotification, Mode, ResourceDescriptor,
    CONTENT_TYPE_CLOUDEVENTS_JSON,
};

/// Fixed prefix of every event type; sinks filter on
/// `<prefix>.<group>.<kind>.<verb>` without parsing payloads.
pub const EVENT_TYPE_PREFIX: &str = "io.kubespout.resource";

const SPEC_VERSION: &str = "1.0";

/// Event type for a descriptor and lifecycle verb, e.g.
/// `io.kubespout.resource.apps.deployment.update`.
pub fn event_type(descriptor: &ResourceDescriptor, kind: LifecycleKind) -> String {
    format!(
        "{}.{}.{}.{}",
        EVENT_TYPE_PREFIX,
        descriptor.group_or_core(),
        descriptor.kind.to_lowercase(),
        kind.verb()
    )
}

/// Event id, unique per (namespace, kind, name, verb, resourceVersion) tuple.
pub fn event_id(n: &LifecycleNotification) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        n.namespace,
        n.descriptor.kind,
        n.name,
        n.kind.verb(),
        n.resource_version
    )
}

/// Deterministic notification-to-event translation. Holds the two pieces of
/// ambient context an event needs beyond the notification itself: the payload
/// mode and the cluster base URI events claim as their source.
#[derive(Debug, Clone)]
pub struct Translator {
    mode: Mode,
    source_base: String,
}

impl Translator {
    pub fn new(mode: Mode, source_base: impl Into<String>) -> Self {
        let mut source_base = source_base.into();
        while source_base.ends_with('/') {
            source_base.pop();
        }
        Self { mode, source_base }
    }

    /// Never fails: a payload that cannot be rendered yields an event with an
    /// empty data section and a translation-error marker instead.
    pub fn translate(&self, n: &LifecycleNotification) -> CanonicalEvent {
        let (data, translation_error) = match self.mode {
            Mode::Resource => resource_payload(n),
            Mode::Ref => (Some(ref_payload(n)), None),
        };
        CanonicalEvent {
            specversion: SPEC_VERSION.to_string(),
            id: event_id(n),
            ty: event_type(&n.descriptor, n.kind),
            source: self.event_source(n),
            subject: n.name.clone(),
            time: n.timestamp,
            datacontenttype: CONTENT_TYPE_CLOUDEVENTS_JSON.to_string(),
            data,
            translation_error,
        }
    }

    /// Resource collection URI under the cluster base, e.g.
    /// `https://host/apis/apps/v1/namespaces/prod/deployments`.
    fn event_source(&self, n: &LifecycleNotification) -> String {
        let d = &n.descriptor;
        let mut out = String::with_capacity(self.source_base.len() + 48);
        out.push_str(&self.source_base);
        if d.group.is_empty() {
            out.push_str("/api/");
        } else {
            out.push_str("/apis/");
            out.push_str(&d.group);
            out.push('/');
        }
        out.push_str(&d.version);
        if !n.namespace.is_empty() {
            out.push_str("/namespaces/");
            out.push_str(&n.namespace);
        }
        out.push('/');
        out.push_str(&d.resource_plural());
        out
    }
}

fn resource_payload(n: &LifecycleNotification) -> (Option<serde_json::Value>, Option<String>) {
    if n.resource.is_object() {
        (Some(n.resource.clone()), None)
    } else {
        (None, Some("resource payload is not a structured object".to_string()))
    }
}

/// Reference payload: the object itself, or its controlling owner when the
/// descriptor carries controller semantics.
fn ref_payload(n: &LifecycleNotification) -> serde_json::Value {
    if n.descriptor.is_controller {
        if let Some(owner) = controller_owner(&n.resource) {
            let mut reference = serde_json::json!({
                "apiVersion": owner["apiVersion"],
                "kind": owner["kind"],
                "name": owner["name"],
            });
            if !n.namespace.is_empty() {
                reference["namespace"] = serde_json::Value::String(n.namespace.clone());
            }
            return reference;
        }
    }
    let mut reference = serde_json::json!({
        "apiVersion": n.descriptor.api_version(),
        "kind": n.descriptor.kind,
        "name": n.name,
        "resourceVersion": n.resource_version,
    });
    if !n.namespace.is_empty() {
        reference["namespace"] = serde_json::Value::String(n.namespace.clone());
    }
    reference
}

fn controller_owner(resource: &serde_json::Value) -> Option<&serde_json::Value> {
    resource
        .get("metadata")?
        .get("ownerReferences")?
        .as_array()?
        .iter()
        .find(|o| o.get("controller").and_then(|c| c.as_bool()).unwrap_or(false))
}
