//! Per-task request-processing context
//!
//! Stands in for a private connection object: built fresh for every task,
//! handed explicitly to the pipeline and only ever touched by the worker
//! executing that task.

use crate::protocol::StreamId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RequestContext {
    context_id: Uuid,
    stream_id: StreamId,
    connection_id: Uuid,
    created_at: DateTime<Utc>,
    restricted_filters: bool,
    disabled_filters: BTreeSet<String>,
    notes: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(stream_id: StreamId, connection_id: Uuid) -> Self {
        Self {
            context_id: Uuid::new_v4(),
            stream_id,
            connection_id,
            created_at: Utc::now(),
            restricted_filters: false,
            disabled_filters: BTreeSet::new(),
            notes: HashMap::new(),
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the restricted filter set applies to this request
    pub fn is_restricted(&self) -> bool {
        self.restricted_filters
    }

    /// Switch to the restricted filter set, disabling `filters`
    pub fn restrict_filters<I, S>(&mut self, filters: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restricted_filters = true;
        self.disabled_filters
            .extend(filters.into_iter().map(Into::into));
    }

    pub fn is_filter_enabled(&self, name: &str) -> bool {
        !self.disabled_filters.contains(name)
    }

    pub fn disabled_filters(&self) -> impl Iterator<Item = &str> {
        self.disabled_filters.iter().map(String::as_str)
    }

    pub fn set_note(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.notes.insert(key.into(), value.into());
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }
}
