use std::{
    collections::{HashMap, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
};

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, error, warn};

use crate::utils::clock::Clock;

use super::types::{Event, EventType, EventValidationError};

const DEFAULT_HISTORY_LIMIT: usize = 1000;
const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const MAX_BACKOFF_SECONDS: i64 = 300;

/// A subscriber. Handlers are invoked synchronously on whichever thread called
/// [EventDispatcher::dispatch]; a handler that never returns stalls its caller.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Registration identity: the allocation behind the `Arc`. Subscribing the same
/// `Arc` twice is a no-op, two clones of one `Arc` are one handler.
type HandlerId = usize;

fn handler_id(handler: &Arc<dyn EventHandler>) -> HandlerId {
    Arc::as_ptr(handler) as *const () as usize
}

/// Failure bookkeeping for one handler. Created lazily on first failure,
/// removed on unsubscribe.
#[derive(Debug, Clone)]
pub struct HandlerErrorState {
    handler_name: String,
    event_type: Option<EventType>,
    error_count: u32,
    last_error_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    disabled: bool,
}

impl HandlerErrorState {
    fn new(handler_name: String, event_type: Option<EventType>) -> Self {
        Self {
            handler_name,
            event_type,
            error_count: 0,
            last_error_time: None,
            last_error: None,
            disabled: false,
        }
    }

    fn record_failure(&mut self, now: DateTime<Utc>, message: String) {
        self.error_count += 1;
        self.last_error_time = Some(now);
        self.last_error = Some(message);
        if self.error_count >= MAX_CONSECUTIVE_FAILURES {
            // Sticky. Only unsubscribe+resubscribe brings the handler back.
            self.disabled = true;
        }
    }

    fn reset(&mut self) {
        self.error_count = 0;
        self.last_error_time = None;
        self.last_error = None;
        self.disabled = false;
    }
}

/// Whether a handler may be invoked at `now`. Disabled handlers never run;
/// failed ones wait out an exponential backoff window before the next attempt.
pub fn eligible(state: &HandlerErrorState, now: DateTime<Utc>) -> bool {
    if state.disabled {
        return false;
    }
    if state.error_count > 0 {
        let wait = Duration::seconds(
            MAX_BACKOFF_SECONDS.min(2i64.saturating_pow(state.error_count.min(30))),
        );
        if let Some(last) = state.last_error_time {
            if now - last < wait {
                return false;
            }
        }
    }
    true
}

/// Introspection row returned by [EventDispatcher::get_handler_status].
#[derive(Debug, Clone)]
pub struct HandlerStatus {
    pub handler: String,
    pub error_count: u32,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub disabled: bool,
}

#[derive(Default)]
struct Registrations {
    typed: HashMap<EventType, HashMap<HandlerId, Arc<dyn EventHandler>>>,
    global: HashMap<HandlerId, Arc<dyn EventHandler>>,
}

struct HandlerFailure {
    handler_name: String,
    event_type: Option<EventType>,
    message: String,
}

/// In-process publish/subscribe bus. Safe to share across threads; explicitly
/// constructed and injected by the composing application, never a process-wide
/// singleton.
///
/// Three separate mutexes guard registrations, history and error bookkeeping so
/// that a slow handler (which runs outside every lock) never blocks history
/// reads or registration changes from other threads.
pub struct EventDispatcher {
    registrations: Mutex<Registrations>,
    history: Mutex<VecDeque<Event>>,
    errors: Mutex<HashMap<HandlerId, HandlerErrorState>>,
    history_limit: usize,
    clock: Arc<dyn Clock>,
}

/// Recovers the data behind a poisoned mutex. The poison flag is reported to
/// the caller so `dispatch` can surface it as a `dispatch_error` event.
fn lock_recovering<T>(mutex: &Mutex<T>) -> (MutexGuard<'_, T>, bool) {
    match mutex.lock() {
        Ok(guard) => (guard, false),
        Err(poisoned) => (poisoned.into_inner(), true),
    }
}

impl EventDispatcher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_history_limit(clock, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(clock: Arc<dyn Clock>, history_limit: usize) -> Self {
        Self {
            registrations: Mutex::default(),
            history: Mutex::new(VecDeque::new()),
            errors: Mutex::new(HashMap::new()),
            history_limit,
            clock,
        }
    }

    /// Registers `handler` for one event type, or for every event when
    /// `event_type` is [None]. Subscribing an already subscribed pair is a
    /// no-op.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>, event_type: Option<EventType>) {
        let id = handler_id(&handler);
        let (mut registrations, _) = lock_recovering(&self.registrations);
        match event_type {
            Some(event_type) => {
                registrations
                    .typed
                    .entry(event_type)
                    .or_default()
                    .insert(id, handler);
            }
            None => {
                registrations.global.insert(id, handler);
            }
        }
    }

    /// Removes the registration and drops the handler's error state, so a
    /// later resubscribe starts with a clean record.
    pub fn unsubscribe(&self, handler: &Arc<dyn EventHandler>, event_type: Option<EventType>) {
        let id = handler_id(handler);
        {
            let (mut registrations, _) = lock_recovering(&self.registrations);
            match event_type {
                Some(event_type) => {
                    if let Some(set) = registrations.typed.get_mut(&event_type) {
                        set.remove(&id);
                        if set.is_empty() {
                            registrations.typed.remove(&event_type);
                        }
                    }
                }
                None => {
                    registrations.global.remove(&id);
                }
            }
        }
        lock_recovering(&self.errors).0.remove(&id);
    }

    /// Delivers `event` to every eligible subscriber. Handler failures never
    /// reach the caller; only validation failures do.
    pub fn dispatch(&self, event: &Event) -> Result<(), EventValidationError> {
        // Validation failures propagate unchanged. They never enter history and
        // never produce synthetic error events, which would loop forever on a
        // malformed error event.
        event
            .validate()
            .inspect_err(|e| error!("Rejected invalid {} event: {e}", event.event_type()))?;

        let mut bookkeeping_fault = false;

        bookkeeping_fault |= self.push_history(event.clone());

        let event_type = event.event_type();
        let (typed, global) = {
            let (registrations, fault) = lock_recovering(&self.registrations);
            bookkeeping_fault |= fault;
            (
                registrations
                    .typed
                    .get(&event_type)
                    .map(|set| set.values().cloned().collect::<Vec<_>>())
                    .unwrap_or_default(),
                registrations.global.values().cloned().collect::<Vec<_>>(),
            )
        };
        // Locks are released here; handlers run lock-free so other threads can
        // subscribe, dispatch and read history while they execute. Registration
        // changes made by a handler apply from the next dispatch on.

        self.deliver_all(typed, event, Some(event_type), true);
        self.deliver_all(global, event, None, true);

        if bookkeeping_fault {
            error!("Dispatcher bookkeeping lock was poisoned while dispatching {event_type}");
            self.dispatch_synthetic_error(
                "dispatch_error",
                "dispatcher bookkeeping lock poisoned".to_owned(),
                json!({ "event_type": event_type.as_str() }),
                event.timestamp(),
            );
        }

        Ok(())
    }

    /// Invokes each handler in turn, isolating failures. When
    /// `synthesize_errors` is set, each failure is surfaced to `error`
    /// subscribers; the synthetic-error path itself runs with it cleared,
    /// which is what keeps a failing error handler from spawning more error
    /// events.
    fn deliver_all(
        &self,
        handlers: Vec<Arc<dyn EventHandler>>,
        event: &Event,
        registered_for: Option<EventType>,
        synthesize_errors: bool,
    ) {
        let is_error_event = event.event_type() == EventType::Error;
        for handler in handlers {
            let Some(failure) = self.call_handler(&handler, event, registered_for) else {
                continue;
            };
            if synthesize_errors && !is_error_event {
                self.dispatch_synthetic_error(
                    "handler_error",
                    failure.message.clone(),
                    json!({
                        "handler": failure.handler_name,
                        "event_type": failure.event_type.map(|t| t.as_str()),
                        "error": failure.message,
                    }),
                    event.timestamp(),
                );
            }
        }
    }

    /// One guarded handler invocation. Returns the failure, if any, for the
    /// caller to decide whether a synthetic error event is warranted.
    fn call_handler(
        &self,
        handler: &Arc<dyn EventHandler>,
        event: &Event,
        registered_for: Option<EventType>,
    ) -> Option<HandlerFailure> {
        let id = handler_id(handler);
        let now = self.clock.time();
        {
            let (errors, _) = lock_recovering(&self.errors);
            if let Some(state) = errors.get(&id) {
                if !eligible(state, now) {
                    debug!(
                        "Skipping handler {} ({} failures{})",
                        handler.name(),
                        state.error_count,
                        if state.disabled { ", disabled" } else { ", backing off" },
                    );
                    return None;
                }
            }
        }

        // A panicking handler must not unwind into the publisher.
        let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
        let message = match outcome {
            Ok(Ok(())) => {
                if let Some(state) = lock_recovering(&self.errors).0.get_mut(&id) {
                    state.reset();
                }
                return None;
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(panic) => panic_message(&panic),
        };

        warn!(
            "Handler {} failed on {} event: {message}",
            handler.name(),
            event.event_type()
        );

        let (mut errors, _) = lock_recovering(&self.errors);
        let state = errors.entry(id).or_insert_with(|| {
            HandlerErrorState::new(handler.name().to_owned(), registered_for)
        });
        state.record_failure(now, message.clone());
        if state.disabled {
            error!(
                "Handler {} disabled after {} consecutive failures",
                handler.name(),
                state.error_count
            );
        }

        Some(HandlerFailure {
            handler_name: handler.name().to_owned(),
            event_type: registered_for,
            message,
        })
    }

    /// Builds an error event and delivers it to subscribers of the literal
    /// `error` type only, one recursion level deep.
    fn dispatch_synthetic_error(
        &self,
        error_type: &str,
        message: String,
        details: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) {
        let error_event = Event::Error {
            error_type: error_type.to_owned(),
            error_message: message,
            details: Some(details),
            timestamp,
        };

        let error_handlers = {
            let (registrations, _) = lock_recovering(&self.registrations);
            registrations
                .typed
                .get(&EventType::Error)
                .map(|set| set.values().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        };

        self.deliver_all(error_handlers, &error_event, Some(EventType::Error), false);

        // Recorded after its handlers ran, mirroring dispatch order for
        // ordinary events as seen by history readers.
        self.push_history(error_event);
    }

    fn push_history(&self, event: Event) -> bool {
        let (mut history, fault) = lock_recovering(&self.history);
        history.push_back(event);
        while history.len() > self.history_limit {
            history.pop_front();
        }
        fault
    }

    /// Up to `limit` most recent events, oldest first, optionally filtered by
    /// type. Returns copies; history itself stays untouched.
    pub fn get_recent_events(&self, event_type: Option<EventType>, limit: usize) -> Vec<Event> {
        let (history, _) = lock_recovering(&self.history);
        let matching: Vec<Event> = history
            .iter()
            .filter(|e| event_type.map_or(true, |t| e.event_type() == t))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    pub fn clear_history(&self) {
        lock_recovering(&self.history).0.clear();
    }

    /// Error bookkeeping per event type (`"global"` for untyped handlers).
    /// Handlers that never failed, or succeeded since, show a zeroed row only
    /// if they failed at least once before.
    pub fn get_handler_status(&self) -> HashMap<String, Vec<HandlerStatus>> {
        let (errors, _) = lock_recovering(&self.errors);
        let mut status: HashMap<String, Vec<HandlerStatus>> = HashMap::new();
        for state in errors.values() {
            let key = state
                .event_type
                .map(|t| t.as_str().to_owned())
                .unwrap_or_else(|| "global".to_owned());
            status.entry(key).or_default().push(HandlerStatus {
                handler: state.handler_name.clone(),
                error_count: state.error_count,
                last_error_time: state.last_error_time,
                last_error: state.last_error.clone(),
                disabled: state.disabled,
            });
        }
        status
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_owned()
    }
}
