//! Realtime change-feed types and the transport seam.
//!
//! A channel is scoped to `(table, event, row filter)`. The transport opens
//! the underlying push connection for one channel and yields the change
//! payloads the platform delivers, in delivery order.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::{RealtimeError, ValidationError};

/// Kind of table change. `Any` is only meaningful as a subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    #[default]
    #[serde(rename = "*")]
    Any,
}

impl ChangeKind {
    /// Whether a subscription filter of `self` accepts an event of `kind`.
    pub fn accepts(&self, kind: ChangeKind) -> bool {
        matches!(self, Self::Any) || *self == kind
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change payload: `{eventType, table, record, oldRecord?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub event_type: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub record: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    /// The row the event is about: the new record, or the old one for deletes.
    pub fn row(&self) -> Option<&Value> {
        self.record
            .as_ref()
            .filter(|r| !r.is_null())
            .or(self.old_record.as_ref())
    }
}

// ============================================================================
// ROW FILTERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
}

impl FilterOp {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::In => "in",
        }
    }
}

/// Row predicate in platform syntax: `column=op.value`, e.g.
/// `user_id=eq.42` or `status=in.(open,closed)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowFilter {
    pub column: String,
    pub op: FilterOp,
    pub values: Vec<String>,
}

impl RowFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: FilterOp::Eq,
            values: vec![value.into()],
        }
    }

    /// Evaluate against a JSON row. Missing columns never match.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        let actual = scalar_text(actual);
        let Some(expected) = self.values.first() else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == *expected,
            FilterOp::Neq => actual != *expected,
            FilterOp::In => self.values.iter().any(|v| *v == actual),
            FilterOp::Lt => compare(&actual, expected) == Ordering::Less,
            FilterOp::Lte => compare(&actual, expected) != Ordering::Greater,
            FilterOp::Gt => compare(&actual, expected) == Ordering::Greater,
            FilterOp::Gte => compare(&actual, expected) != Ordering::Less,
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y),
        _ => a.cmp(b),
    }
}

impl FromStr for RowFilter {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidRowFilter {
            filter: s.to_string(),
            reason: reason.to_string(),
        };
        let (column, rest) = s.split_once('=').ok_or_else(|| invalid("missing '='"))?;
        let (op, value) = rest
            .split_once('.')
            .ok_or_else(|| invalid("expected op.value"))?;
        if column.trim().is_empty() {
            return Err(invalid("empty column"));
        }
        let op = match op {
            "eq" => FilterOp::Eq,
            "neq" => FilterOp::Neq,
            "lt" => FilterOp::Lt,
            "lte" => FilterOp::Lte,
            "gt" => FilterOp::Gt,
            "gte" => FilterOp::Gte,
            "in" => FilterOp::In,
            _ => return Err(invalid("unknown operator")),
        };
        let values = if op == FilterOp::In {
            let inner = value
                .strip_prefix('(')
                .and_then(|v| v.strip_suffix(')'))
                .ok_or_else(|| invalid("in expects (a,b,...)"))?;
            inner.split(',').map(|v| v.trim().to_string()).collect()
        } else {
            vec![value.to_string()]
        };
        Ok(Self {
            column: column.to_string(),
            op,
            values,
        })
    }
}

impl fmt::Display for RowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op == FilterOp::In {
            write!(f, "{}=in.({})", self.column, self.values.join(","))
        } else {
            write!(
                f,
                "{}={}.{}",
                self.column,
                self.op.as_str(),
                self.values.first().map(String::as_str).unwrap_or("")
            )
        }
    }
}

// ============================================================================
// CHANNELS
// ============================================================================

/// Scope of one realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    pub table: String,
    pub event: ChangeKind,
    pub row_filter: Option<RowFilter>,
}

impl ChannelSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event: ChangeKind::Any,
            row_filter: None,
        }
    }

    pub fn with_event(mut self, event: ChangeKind) -> Self {
        self.event = event;
        self
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.row_filter = Some(filter);
        self
    }

    /// Whether `event` belongs on this channel.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || !self.event.accepts(event.event_type) {
            return false;
        }
        match (&self.row_filter, event.row()) {
            (None, _) => true,
            (Some(filter), Some(row)) => filter.matches(row),
            (Some(_), None) => false,
        }
    }
}

/// Change payloads of one open channel. The stream ending means the
/// connection dropped.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, RealtimeError>>;

/// Opens push connections for realtime channels.
#[async_trait]
pub trait ChangeTransport: Send + Sync + 'static {
    async fn connect(&self, spec: &ChannelSpec) -> Result<ChangeStream, RealtimeError>;
}
