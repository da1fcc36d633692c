//! Maps raw change records onto [`Event`]s.

use chrono::{DateTime, Utc};
use k8s_openapi::api::{core::v1 as core_v1, events::v1 as events_v1};
use kube_core::{ApiResource, DynamicObject};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::event::{ChangeKind, Event};

/// A record that could not be normalized. The record is skipped; the feed continues.
#[derive(Debug, thiserror::Error)]
pub enum MalformedRecord {
    #[error("record does not match the {expected} schema: {source}")]
    Schema {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("record of kind {found} in a feed of kind {expected}")]
    KindMismatch { expected: String, found: String },
    #[error("record has no {0}")]
    Missing(&'static str),
}

/// How the changed entity is located inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// `v1/Event`: the entity is `involvedObject`, the text is `message`.
    CoreEvent,
    /// `events.k8s.io/v1/Event`: the entity is `regarding`, the text is `note`.
    EventsEvent,
    /// Any other object: the entity is the object itself.
    Object,
}

pub struct Normalizer {
    shape: Shape,
    kind: String,
    last_observed: Mutex<Option<DateTime<Utc>>>,
}

impl Normalizer {
    /// Creates a normalizer for records of the given collection.
    pub fn for_resource(resource: &ApiResource) -> Self {
        let shape = match (resource.group.as_str(), resource.kind.as_str()) {
            ("", "Event") => Shape::CoreEvent,
            ("events.k8s.io", "Event") => Shape::EventsEvent,
            _ => Shape::Object,
        };
        Self {
            shape,
            kind: resource.kind.clone(),
            last_observed: Mutex::new(None),
        }
    }

    pub fn normalize(
        &self,
        change_kind: ChangeKind,
        object: DynamicObject,
    ) -> Result<Event, MalformedRecord> {
        if let Some(types) = &object.types {
            if types.kind != self.kind {
                return Err(MalformedRecord::KindMismatch {
                    expected: self.kind.clone(),
                    found: types.kind.clone(),
                });
            }
        }

        let (resource_kind, namespace, name, message) = match self.shape {
            Shape::CoreEvent => {
                let event: core_v1::Event = parse(object, "v1/Event")?;
                let involved = event.involved_object;
                (involved.kind, involved.namespace, involved.name, event.message)
            }
            Shape::EventsEvent => {
                let event: events_v1::Event = parse(object, "events.k8s.io/v1/Event")?;
                let regarding = event
                    .regarding
                    .ok_or(MalformedRecord::Missing("regarding object"))?;
                (regarding.kind, regarding.namespace, regarding.name, event.note)
            }
            Shape::Object => {
                let message = object
                    .data
                    .pointer("/status/message")
                    .and_then(|message| message.as_str())
                    .map(str::to_owned);
                let kind = object
                    .types
                    .map_or_else(|| self.kind.clone(), |types| types.kind);
                (
                    Some(kind),
                    object.metadata.namespace,
                    object.metadata.name,
                    message,
                )
            }
        };

        Ok(Event {
            change_kind,
            resource_kind: resource_kind
                .filter(|kind| !kind.is_empty())
                .ok_or(MalformedRecord::Missing("kind"))?,
            namespace: namespace.unwrap_or_default(),
            name: name
                .filter(|name| !name.is_empty())
                .ok_or(MalformedRecord::Missing("name"))?,
            message: message.unwrap_or_default(),
            observed_at: self.observed_at(),
        })
    }

    /// Wall-clock time, never earlier than a previously returned value.
    fn observed_at(&self) -> DateTime<Utc> {
        let mut last = self.last_observed.lock();
        let now = match *last {
            Some(last) => Utc::now().max(last),
            None => Utc::now(),
        };
        *last = Some(now);
        now
    }
}

fn parse<K: DeserializeOwned>(
    object: DynamicObject,
    expected: &'static str,
) -> Result<K, MalformedRecord> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|source| MalformedRecord::Schema { expected, source })
}
