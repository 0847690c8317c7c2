//! Substrate Logging and Tracing
//!
//! Structured events for the protocol points of the substrate, useful for:
//! - Debugging suspension races
//! - Following concurrent-mark status flips
//! - Spotting allocation pressure
//!
//! Log Levels:
//! - ERROR: allocation failures
//! - WARN: abandoned work
//! - INFO: VM-wide suspension, mark status changes
//! - DEBUG: per-thread suspension and region provisioning
//! - TRACE: remembered-set creation
//!
//! Free-form diagnostics go through the `log` facade; the events here are
//! kept in a bounded history so tests and embedders can inspect them.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Log level for substrate events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// Substrate event types
#[derive(Debug, Clone, PartialEq)]
pub enum SubstrateEvent {
    /// A coordinator asked one thread to suspend
    SuspendRequested { thread: u32, count: u32 },

    /// A thread reached the Suspended state
    ThreadParked { thread: u32, on_behalf: bool },

    /// A thread left the Suspended state
    ThreadResumed { thread: u32, state: String },

    /// VM-wide suspension armed
    SuspendAllRequested {
        requester: Option<u32>,
        pending: usize,
    },

    /// Every requested thread confirmed suspension
    SuspendAllReached { threads: usize },

    /// VM-wide suspension lifted
    ResumeAll { threads: usize },

    /// Concurrent mark status flipped for one heap
    MarkStatusChanged {
        heap: String,
        status: String,
        threads: usize,
    },

    /// A remembered set was created lazily
    RememberedSetCreated { region: usize, kind: String },

    /// A free region descriptor was put into use
    RegionProvisioned {
        region: usize,
        kind: String,
        span: usize,
    },

    /// Slow-path allocation ran out of regions
    AllocationFailure {
        size: usize,
        generation: String,
        after_hook: bool,
    },

    /// Pending jobs dropped without running
    JobsAbandoned { thread: u32, count: usize },
}

impl SubstrateEvent {
    /// Short machine-readable tag
    pub fn name(&self) -> &'static str {
        match self {
            SubstrateEvent::SuspendRequested { .. } => "suspend_requested",
            SubstrateEvent::ThreadParked { .. } => "thread_parked",
            SubstrateEvent::ThreadResumed { .. } => "thread_resumed",
            SubstrateEvent::SuspendAllRequested { .. } => "suspend_all_requested",
            SubstrateEvent::SuspendAllReached { .. } => "suspend_all_reached",
            SubstrateEvent::ResumeAll { .. } => "resume_all",
            SubstrateEvent::MarkStatusChanged { .. } => "mark_status_changed",
            SubstrateEvent::RememberedSetCreated { .. } => "remembered_set_created",
            SubstrateEvent::RegionProvisioned { .. } => "region_provisioned",
            SubstrateEvent::AllocationFailure { .. } => "allocation_failure",
            SubstrateEvent::JobsAbandoned { .. } => "jobs_abandoned",
        }
    }

    /// Log level for event
    pub fn level(&self) -> LogLevel {
        match self {
            SubstrateEvent::AllocationFailure { .. } => LogLevel::Error,
            SubstrateEvent::JobsAbandoned { .. } => LogLevel::Warn,
            SubstrateEvent::SuspendAllRequested { .. }
            | SubstrateEvent::SuspendAllReached { .. }
            | SubstrateEvent::ResumeAll { .. }
            | SubstrateEvent::MarkStatusChanged { .. } => LogLevel::Info,
            SubstrateEvent::SuspendRequested { .. }
            | SubstrateEvent::ThreadParked { .. }
            | SubstrateEvent::ThreadResumed { .. }
            | SubstrateEvent::RegionProvisioned { .. } => LogLevel::Debug,
            SubstrateEvent::RememberedSetCreated { .. } => LogLevel::Trace,
        }
    }

    /// Human-readable one-liner
    pub fn describe(&self) -> String {
        match self {
            SubstrateEvent::SuspendRequested { thread, count } => {
                format!("thread {} suspend requested (depth {})", thread, count)
            },
            SubstrateEvent::ThreadParked { thread, on_behalf } => {
                if *on_behalf {
                    format!("thread {} parked on its behalf", thread)
                } else {
                    format!("thread {} parked at safepoint", thread)
                }
            },
            SubstrateEvent::ThreadResumed { thread, state } => {
                format!("thread {} resumed to {}", thread, state)
            },
            SubstrateEvent::SuspendAllRequested { requester, pending } => match requester {
                Some(id) => format!(
                    "suspend-all requested by thread {} ({} pending)",
                    id, pending
                ),
                None => format!("suspend-all requested ({} pending)", pending),
            },
            SubstrateEvent::SuspendAllReached { threads } => {
                format!("all {} threads suspended", threads)
            },
            SubstrateEvent::ResumeAll { threads } => format!("resumed {} threads", threads),
            SubstrateEvent::MarkStatusChanged {
                heap,
                status,
                threads,
            } => format!("{} mark status -> {} on {} threads", heap, status, threads),
            SubstrateEvent::RememberedSetCreated { region, kind } => {
                format!("{} remembered set created for region {}", kind, region)
            },
            SubstrateEvent::RegionProvisioned { region, kind, span } => {
                format!("region {} provisioned as {} (span {})", region, kind, span)
            },
            SubstrateEvent::AllocationFailure {
                size,
                generation,
                after_hook,
            } => format!(
                "allocation of {} bytes in {} failed{}",
                size,
                generation,
                if *after_hook { " after collector hook" } else { "" }
            ),
            SubstrateEvent::JobsAbandoned { thread, count } => {
                format!("thread {} abandoned {} pending jobs", thread, count)
            },
        }
    }

    /// JSON form of the event
    pub fn to_json(&self) -> serde_json::Value {
        let body = match self {
            SubstrateEvent::SuspendRequested { thread, count } => serde_json::json!({
                "thread": thread,
                "count": count
            }),
            SubstrateEvent::ThreadParked { thread, on_behalf } => serde_json::json!({
                "thread": thread,
                "on_behalf": on_behalf
            }),
            SubstrateEvent::ThreadResumed { thread, state } => serde_json::json!({
                "thread": thread,
                "state": state
            }),
            SubstrateEvent::SuspendAllRequested { requester, pending } => serde_json::json!({
                "requester": requester,
                "pending": pending
            }),
            SubstrateEvent::SuspendAllReached { threads }
            | SubstrateEvent::ResumeAll { threads } => serde_json::json!({
                "threads": threads
            }),
            SubstrateEvent::MarkStatusChanged {
                heap,
                status,
                threads,
            } => serde_json::json!({
                "heap": heap,
                "status": status,
                "threads": threads
            }),
            SubstrateEvent::RememberedSetCreated { region, kind } => serde_json::json!({
                "region": region,
                "kind": kind
            }),
            SubstrateEvent::RegionProvisioned { region, kind, span } => serde_json::json!({
                "region": region,
                "kind": kind,
                "span": span
            }),
            SubstrateEvent::AllocationFailure {
                size,
                generation,
                after_hook,
            } => serde_json::json!({
                "size": size,
                "generation": generation,
                "after_hook": after_hook
            }),
            SubstrateEvent::JobsAbandoned { thread, count } => serde_json::json!({
                "thread": thread,
                "count": count
            }),
        };

        serde_json::json!({ "type": self.name(), "data": body })
    }
}

/// Event logger configuration
#[derive(Debug, Clone)]
pub struct EventLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Print events to stderr
    pub console: bool,

    /// Print JSON lines instead of text
    pub json: bool,

    /// Prefix console output with a wall-clock timestamp
    pub timestamps: bool,

    /// Events kept in memory before the oldest are dropped
    pub history: usize,
}

impl Default for EventLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Debug,
            console: false,
            json: false,
            timestamps: true,
            history: 4096,
        }
    }
}

impl EventLoggerConfig {
    /// Console output on, every level, as selected by `ShgcConfig::verbose`
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Trace,
            console: true,
            ..Self::default()
        }
    }
}

/// Event logger with a bounded in-memory history
pub struct EventLogger {
    config: EventLoggerConfig,
    events: Mutex<VecDeque<(Instant, SubstrateEvent)>>,
    total: AtomicU64,
    enabled: AtomicBool,
}

impl EventLogger {
    pub fn new(config: EventLoggerConfig) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(config.history.min(1024))),
            config,
            total: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Record an event
    pub fn log(&self, event: SubstrateEvent) {
        if !self.is_enabled() || event.level() > self.config.level {
            return;
        }

        if self.config.console {
            self.output_console(&event);
        }

        self.total.fetch_add(1, Ordering::Relaxed);
        let mut events = self.events.lock();
        if self.config.history > 0 && events.len() >= self.config.history {
            events.pop_front();
        }
        events.push_back((Instant::now(), event));
    }

    fn output_console(&self, event: &SubstrateEvent) {
        let prefix = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            match serde_json::to_string(&event.to_json()) {
                Ok(line) => eprintln!("{}{}", prefix, line),
                Err(e) => log::warn!("failed to serialise {} event: {}", event.name(), e),
            }
        } else {
            eprintln!("{}[SHGC] {}", prefix, event.describe());
        }
    }

    /// Copy of the retained history
    pub fn events(&self) -> Vec<SubstrateEvent> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Events ever recorded, including those dropped from history
    pub fn event_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new(EventLoggerConfig::default())
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<EventLogger> = Mutex::new(EventLogger::default());
}

/// Log an event to the global logger
pub fn log_event(event: SubstrateEvent) {
    GLOBAL_LOGGER.lock().log(event);
}

/// Replace the global logger
pub fn configure_logger(config: EventLoggerConfig) {
    *GLOBAL_LOGGER.lock() = EventLogger::new(config);
}

/// Events recorded by the global logger
pub fn event_count() -> u64 {
    GLOBAL_LOGGER.lock().event_count()
}

/// Retained history of the global logger
pub fn recent_events() -> Vec<SubstrateEvent> {
    GLOBAL_LOGGER.lock().events()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_basic() {
        let logger = EventLogger::default();
        logger.log(SubstrateEvent::SuspendRequested {
            thread: 1,
            count: 1,
        });
        assert_eq!(logger.event_count(), 1);
        assert_eq!(logger.events()[0].name(), "suspend_requested");
    }

    #[test]
    fn test_logger_disable() {
        let logger = EventLogger::default();
        logger.disable();
        logger.log(SubstrateEvent::ResumeAll { threads: 2 });
        assert_eq!(logger.event_count(), 0);
    }

    #[test]
    fn test_level_filter() {
        let logger = EventLogger::new(EventLoggerConfig {
            level: LogLevel::Info,
            ..EventLoggerConfig::default()
        });
        logger.log(SubstrateEvent::RememberedSetCreated {
            region: 3,
            kind: "OldToNew".to_string(),
        });
        logger.log(SubstrateEvent::ResumeAll { threads: 1 });
        assert_eq!(logger.event_count(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let logger = EventLogger::new(EventLoggerConfig {
            history: 2,
            ..EventLoggerConfig::default()
        });
        for thread in 0..5 {
            logger.log(SubstrateEvent::ThreadParked {
                thread,
                on_behalf: false,
            });
        }
        assert_eq!(logger.event_count(), 5);
        let kept = logger.events();
        assert_eq!(kept.len(), 2);
        assert_eq!(
            kept[1],
            SubstrateEvent::ThreadParked {
                thread: 4,
                on_behalf: false
            }
        );
    }

    #[test]
    fn test_json_shape() {
        let json = SubstrateEvent::AllocationFailure {
            size: 64,
            generation: "Young".to_string(),
            after_hook: true,
        }
        .to_json();
        assert_eq!(json["type"], "allocation_failure");
        assert_eq!(json["data"]["size"], 64);
        assert_eq!(json["data"]["after_hook"], true);
    }

    #[test]
    fn test_global_logger() {
        let before = event_count();
        log_event(SubstrateEvent::SuspendAllReached { threads: 0 });
        assert!(event_count() > before);
    }
}
