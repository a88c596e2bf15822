/// Change events describing one document mutation.
///
/// A `ChangeEvent` is produced by a collection write (or received from
/// another instance), emitted on the database's [`ChangeEventBus`], and, when
/// it originated locally on a multi-instance database, forwarded to the other
/// instances attached to the same storage.
///
/// Events are immutable once built; every component that holds one owns its
/// own copy.
///
/// [`ChangeEventBus`]: crate::event_bus::ChangeEventBus
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Kind of mutation carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// A new document was inserted.
    Insert,
    /// An existing document was updated.
    Update,
    /// A document was deleted.
    Delete,
    /// Marker for instance-local bookkeeping.
    Local,
}

impl Operation {
    /// All operation kinds.
    pub const ALL: [Operation; 4] = [
        Operation::Insert,
        Operation::Update,
        Operation::Delete,
        Operation::Local,
    ];
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Local => "LOCAL",
        };
        f.write_str(s)
    }
}

/// A single document mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    operation: Operation,
    document_id: String,
    document_data: Option<JsonValue>,
    previous_data: Option<JsonValue>,
    collection_name: Option<String>,
    origin_token: String,
    is_local: bool,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

impl ChangeEvent {
    fn new(
        operation: Operation,
        collection: Option<String>,
        document_id: impl Into<String>,
        document_data: Option<JsonValue>,
        previous_data: Option<JsonValue>,
        origin_token: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            operation,
            document_id: document_id.into(),
            document_data,
            previous_data,
            collection_name: collection,
            origin_token: origin_token.into(),
            is_local: false,
            start_time: now,
            end_time: now,
        }
    }

    /// Create an insert event.
    pub fn insert(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        data: JsonValue,
        origin_token: impl Into<String>,
    ) -> Self {
        Self::new(
            Operation::Insert,
            Some(collection.into()),
            document_id,
            Some(data),
            None,
            origin_token,
        )
    }

    /// Create an update event.
    pub fn update(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        data: JsonValue,
        previous: JsonValue,
        origin_token: impl Into<String>,
    ) -> Self {
        Self::new(
            Operation::Update,
            Some(collection.into()),
            document_id,
            Some(data),
            Some(previous),
            origin_token,
        )
    }

    /// Create a delete event. The deleted document's last state is kept as
    /// both the document data and the previous data.
    pub fn delete(
        collection: impl Into<String>,
        document_id: impl Into<String>,
        previous: JsonValue,
        origin_token: impl Into<String>,
    ) -> Self {
        Self::new(
            Operation::Delete,
            Some(collection.into()),
            document_id,
            Some(previous.clone()),
            Some(previous),
            origin_token,
        )
    }

    /// Create a local marker event. Always instance-local.
    pub fn local_marker(document_id: impl Into<String>, origin_token: impl Into<String>) -> Self {
        Self::new(Operation::Local, None, document_id, None, None, origin_token).local()
    }

    /// Mark this event as instance-local: it is never broadcast.
    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }

    /// Set explicit start and end times.
    pub fn with_times(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn document_data(&self) -> Option<&JsonValue> {
        self.document_data.as_ref()
    }

    pub fn previous_data(&self) -> Option<&JsonValue> {
        self.previous_data.as_ref()
    }

    pub fn collection_name(&self) -> Option<&str> {
        self.collection_name.as_deref()
    }

    /// Token of the database instance that produced this event.
    pub fn origin_token(&self) -> &str {
        &self.origin_token
    }

    /// Whether this event must stay inside the producing instance.
    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_event_shape() {
        let event = ChangeEvent::insert("products", "p1", json!({"id": "p1"}), "tokenA");
        assert_eq!(event.operation(), Operation::Insert);
        assert_eq!(event.collection_name(), Some("products"));
        assert_eq!(event.document_id(), "p1");
        assert!(event.previous_data().is_none());
        assert_eq!(event.origin_token(), "tokenA");
        assert!(!event.is_local());
    }

    #[test]
    fn test_update_and_delete_keep_previous() {
        let update = ChangeEvent::update("c", "d", json!({"v": 2}), json!({"v": 1}), "t");
        assert_eq!(update.previous_data(), Some(&json!({"v": 1})));

        let delete = ChangeEvent::delete("c", "d", json!({"v": 2}), "t");
        assert_eq!(delete.operation(), Operation::Delete);
        assert_eq!(delete.previous_data(), Some(&json!({"v": 2})));
    }

    #[test]
    fn test_local_marker_is_local() {
        let marker = ChangeEvent::local_marker("m", "t");
        assert!(marker.is_local());
        assert_eq!(marker.operation(), Operation::Local);
        assert!(marker.collection_name().is_none());
    }

    #[test]
    fn test_wire_format_uses_camel_case() {
        let event = ChangeEvent::insert("c", "d", json!(1), "t");
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["operation"], "INSERT");
        assert_eq!(wire["originToken"], "t");
        assert_eq!(wire["isLocal"], false);

        let back: ChangeEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(back, event);
    }
}
