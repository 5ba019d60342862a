use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::storage::activity::Activity;

/// Literal tag of every event the system can emit. Subscriptions and history
/// filters are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    ActivityStart,
    ActivityEnd,
    IdleStart,
    IdleEnd,
    ProductivityAlert,
    BehaviorPattern,
    SessionStart,
    SessionEnd,
    SessionRestore,
    SystemStatus,
    Error,
    ConfigurationChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ActivityStart => "activity_start",
            EventType::ActivityEnd => "activity_end",
            EventType::IdleStart => "idle_start",
            EventType::IdleEnd => "idle_end",
            EventType::ProductivityAlert => "productivity_alert",
            EventType::BehaviorPattern => "behavior_pattern",
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::SessionRestore => "session_restore",
            EventType::SystemStatus => "system_status",
            EventType::Error => "error",
            EventType::ConfigurationChange => "configuration_change",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Start,
    End,
    Restore,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventValidationError {
    #[error("{field} must be non-negative")]
    Negative { field: &'static str },
    #[error("{field} must be within [0, 1]")]
    OutOfRange { field: &'static str },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} must be a JSON object")]
    NotAnObject { field: &'static str },
}

/// Closed set of domain events. Immutable once constructed; the dispatcher and
/// handlers only ever see shared references, and events are retained solely in
/// the dispatcher's bounded history, never persisted.
#[derive(Debug, Clone)]
pub enum Event {
    ActivityStart {
        activity: Activity,
        timestamp: DateTime<Utc>,
    },
    ActivityEnd {
        activity: Activity,
        /// Seconds between the activity's start and its end.
        duration: f64,
        timestamp: DateTime<Utc>,
    },
    IdleStart {
        last_activity: Option<Activity>,
        timestamp: DateTime<Utc>,
    },
    IdleEnd {
        /// Seconds the user was away.
        idle_duration: f64,
        timestamp: DateTime<Utc>,
    },
    ProductivityAlert {
        productivity_score: f64,
        time_window: String,
        suggestions: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    BehaviorPattern {
        pattern_type: String,
        pattern_data: Value,
        significance: f64,
        timestamp: DateTime<Utc>,
    },
    Session {
        session_id: String,
        kind: SessionKind,
        metadata: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    SystemStatus {
        status: String,
        details: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    Error {
        error_type: String,
        error_message: String,
        details: Option<Value>,
        timestamp: DateTime<Utc>,
    },
    ConfigurationChange {
        setting_key: String,
        old_value: Value,
        new_value: Value,
        source: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::ActivityStart { .. } => EventType::ActivityStart,
            Event::ActivityEnd { .. } => EventType::ActivityEnd,
            Event::IdleStart { .. } => EventType::IdleStart,
            Event::IdleEnd { .. } => EventType::IdleEnd,
            Event::ProductivityAlert { .. } => EventType::ProductivityAlert,
            Event::BehaviorPattern { .. } => EventType::BehaviorPattern,
            Event::Session { kind, .. } => match kind {
                SessionKind::Start => EventType::SessionStart,
                SessionKind::End => EventType::SessionEnd,
                SessionKind::Restore => EventType::SessionRestore,
            },
            Event::SystemStatus { .. } => EventType::SystemStatus,
            Event::Error { .. } => EventType::Error,
            Event::ConfigurationChange { .. } => EventType::ConfigurationChange,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::ActivityStart { timestamp, .. }
            | Event::ActivityEnd { timestamp, .. }
            | Event::IdleStart { timestamp, .. }
            | Event::IdleEnd { timestamp, .. }
            | Event::ProductivityAlert { timestamp, .. }
            | Event::BehaviorPattern { timestamp, .. }
            | Event::Session { timestamp, .. }
            | Event::SystemStatus { timestamp, .. }
            | Event::Error { timestamp, .. }
            | Event::ConfigurationChange { timestamp, .. } => *timestamp,
        }
    }

    /// Checks the variant's invariants. Called by the dispatcher before an
    /// event enters history or reaches any handler.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        match self {
            Event::ActivityStart { .. } => Ok(()),
            Event::ActivityEnd { duration, .. } => non_negative("duration", *duration),
            Event::IdleStart { .. } => Ok(()),
            Event::IdleEnd { idle_duration, .. } => non_negative("idle_duration", *idle_duration),
            Event::ProductivityAlert {
                productivity_score,
                time_window,
                ..
            } => {
                within_unit_interval("productivity_score", *productivity_score)?;
                non_empty("time_window", time_window)
            }
            Event::BehaviorPattern {
                pattern_type,
                pattern_data,
                significance,
                ..
            } => {
                non_empty("pattern_type", pattern_type)?;
                within_unit_interval("significance", *significance)?;
                json_object("pattern_data", pattern_data)
            }
            Event::Session {
                session_id,
                metadata,
                ..
            } => {
                non_empty("session_id", session_id)?;
                optional_json_object("metadata", metadata)
            }
            Event::SystemStatus {
                status, details, ..
            } => {
                non_empty("status", status)?;
                optional_json_object("details", details)
            }
            Event::Error {
                error_type,
                error_message,
                details,
                ..
            } => {
                non_empty("error_type", error_type)?;
                non_empty("error_message", error_message)?;
                optional_json_object("details", details)
            }
            Event::ConfigurationChange { setting_key, .. } => {
                non_empty("setting_key", setting_key)
            }
        }
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), EventValidationError> {
    if value < 0.0 {
        return Err(EventValidationError::Negative { field });
    }
    Ok(())
}

fn within_unit_interval(field: &'static str, value: f64) -> Result<(), EventValidationError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EventValidationError::OutOfRange { field });
    }
    Ok(())
}

fn non_empty(field: &'static str, value: &str) -> Result<(), EventValidationError> {
    if value.is_empty() {
        return Err(EventValidationError::Empty { field });
    }
    Ok(())
}

fn json_object(field: &'static str, value: &Value) -> Result<(), EventValidationError> {
    if !value.is_object() {
        return Err(EventValidationError::NotAnObject { field });
    }
    Ok(())
}

fn optional_json_object(
    field: &'static str,
    value: &Option<Value>,
) -> Result<(), EventValidationError> {
    match value {
        Some(v) => json_object(field, v),
        None => Ok(()),
    }
}
