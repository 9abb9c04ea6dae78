//! Build Logging and Tracing
//!
//! Structured events for one archive build, useful for:
//! - Explaining why an object or subgraph is missing from an archive
//! - Sizing reservations (estimate vs. actual use)
//! - Debugging relocation
//!
//! Every event is forwarded to the `log` facade under the `farc::builder`
//! or `farc::heap` target, kept in memory for inspection, and optionally
//! printed to stderr in human or JSON form.
//!
//! Log Levels:
//! - WARN: degraded output (nullified objects, abandoned subgraphs)
//! - INFO: phases, archive written
//! - DEBUG: regions, relocation summary
//! - TRACE: per-subgraph results

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Log level for build events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn to_log(self) -> log::Level {
        match self {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Build event types
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// Build phase started
    PhaseStart { phase: String },

    /// Build phase completed
    PhaseEnd { phase: String, duration_ms: f64 },

    /// Capacity estimate made after gathering
    CapacityEstimate {
        objects: usize,
        estimated_bytes: usize,
        reserved_bytes: usize,
    },

    /// Core region packed
    RegionPacked { region: String, used_bytes: usize },

    /// Metadata object nullified instead of copied
    ObjectNullified {
        address: u64,
        kind: String,
        reason: String,
    },

    /// Heap subgraph archived for a static field
    SubgraphArchived {
        holder: String,
        field: String,
        objects: usize,
        classes: usize,
    },

    /// Heap subgraph abandoned; the field stays unrestored
    SubgraphAbandoned {
        holder: String,
        field: String,
        reason: String,
    },

    /// Heap archive ranges of one kind closed
    HeapRanges {
        kind: String,
        ranges: usize,
        used_bytes: usize,
    },

    /// Relocation statistics
    RelocationSummary {
        relocated: usize,
        nulls_cleared: usize,
        base_archive_pointers: usize,
    },

    /// Archive file written
    ArchiveWritten {
        path: String,
        file_size: u64,
        crc: u32,
    },
}

/// Build logger configuration
#[derive(Debug, Clone)]
pub struct BuildLoggerConfig {
    /// Minimum log level
    pub level: LogLevel,

    /// Print events to stderr
    pub console: bool,

    /// Print JSON instead of text
    pub json: bool,

    /// Prefix printed events with a timestamp
    pub timestamps: bool,
}

impl Default for BuildLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            timestamps: true,
        }
    }
}

/// Build logger - structured event record of one build
pub struct BuildLogger {
    config: BuildLoggerConfig,
    events: Mutex<Vec<(Instant, BuildEvent)>>,
    enabled: AtomicBool,
}

impl BuildLogger {
    pub fn new(config: BuildLoggerConfig) -> Self {
        Self {
            config,
            events: Mutex::new(Vec::new()),
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

    /// Log a build event
    pub fn log(&self, event: BuildEvent) {
        if !self.is_enabled() {
            return;
        }

        let level = event_level(&event);
        let (target, line) = (event_target(&event), human(&event));
        log::log!(target: target, level.to_log(), "{}", line);

        if level > self.config.level {
            return;
        }

        if self.config.console {
            self.output_console(&event, &line);
        }

        if let Ok(mut events) = self.events.lock() {
            events.push((Instant::now(), event));
        }
    }

    /// Run `f` between a phase start and end event
    pub fn phase<T>(&self, phase: &str, f: impl FnOnce() -> T) -> T {
        self.log(BuildEvent::PhaseStart {
            phase: phase.to_string(),
        });
        let start = Instant::now();
        let result = f();
        self.log(BuildEvent::PhaseEnd {
            phase: phase.to_string(),
            duration_ms: duration_ms(start.elapsed()),
        });
        result
    }

    /// Snapshot of the recorded events
    pub fn events(&self) -> Vec<BuildEvent> {
        self.events
            .lock()
            .map(|events| events.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn output_console(&self, event: &BuildEvent, line: &str) {
        let stamp = if self.config.timestamps {
            format!("[{}] ", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        } else {
            String::new()
        };

        if self.config.json {
            eprintln!("{stamp}{}", json(event));
        } else {
            eprintln!("{stamp}[farc] {line}");
        }
    }
}

impl Default for BuildLogger {
    fn default() -> Self {
        Self::new(BuildLoggerConfig::default())
    }
}

impl std::fmt::Debug for BuildLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildLogger")
            .field("config", &self.config)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn event_level(event: &BuildEvent) -> LogLevel {
    match event {
        BuildEvent::ObjectNullified { .. } | BuildEvent::SubgraphAbandoned { .. } => LogLevel::Warn,
        BuildEvent::PhaseStart { .. }
        | BuildEvent::PhaseEnd { .. }
        | BuildEvent::ArchiveWritten { .. } => LogLevel::Info,
        BuildEvent::CapacityEstimate { .. }
        | BuildEvent::RegionPacked { .. }
        | BuildEvent::HeapRanges { .. }
        | BuildEvent::RelocationSummary { .. } => LogLevel::Debug,
        BuildEvent::SubgraphArchived { .. } => LogLevel::Trace,
    }
}

fn event_target(event: &BuildEvent) -> &'static str {
    match event {
        BuildEvent::SubgraphArchived { .. }
        | BuildEvent::SubgraphAbandoned { .. }
        | BuildEvent::HeapRanges { .. } => "farc::heap",
        _ => "farc::builder",
    }
}

fn human(event: &BuildEvent) -> String {
    match event {
        BuildEvent::PhaseStart { phase } => format!("{phase} phase started"),
        BuildEvent::PhaseEnd { phase, duration_ms } => {
            format!("{phase} phase completed ({duration_ms:.2}ms)")
        },
        BuildEvent::CapacityEstimate {
            objects,
            estimated_bytes,
            reserved_bytes,
        } => format!(
            "estimated {estimated_bytes} bytes for {objects} objects, reserved {reserved_bytes}"
        ),
        BuildEvent::RegionPacked { region, used_bytes } => {
            format!("{region} region packed ({used_bytes} bytes)")
        },
        BuildEvent::ObjectNullified {
            address,
            kind,
            reason,
        } => format!("nullified {kind} {address:#x}: {reason}"),
        BuildEvent::SubgraphArchived {
            holder,
            field,
            objects,
            classes,
        } => format!("archived {holder}::{field}: {objects} objects, {classes} classes"),
        BuildEvent::SubgraphAbandoned {
            holder,
            field,
            reason,
        } => format!("abandoned {holder}::{field}: {reason}"),
        BuildEvent::HeapRanges {
            kind,
            ranges,
            used_bytes,
        } => format!("{kind} heap archive: {ranges} ranges, {used_bytes} bytes"),
        BuildEvent::RelocationSummary {
            relocated,
            nulls_cleared,
            base_archive_pointers,
        } => format!(
            "relocated {relocated} pointers ({base_archive_pointers} into the base archive), \
             cleared {nulls_cleared} null slots"
        ),
        BuildEvent::ArchiveWritten {
            path,
            file_size,
            crc,
        } => format!("wrote {path} ({file_size} bytes, header crc {crc:#010x})"),
    }
}

fn json(event: &BuildEvent) -> serde_json::Value {
    match event {
        BuildEvent::PhaseStart { phase } => serde_json::json!({
            "type": "phase_start",
            "phase": phase
        }),
        BuildEvent::PhaseEnd { phase, duration_ms } => serde_json::json!({
            "type": "phase_end",
            "phase": phase,
            "duration_ms": duration_ms
        }),
        BuildEvent::CapacityEstimate {
            objects,
            estimated_bytes,
            reserved_bytes,
        } => serde_json::json!({
            "type": "capacity_estimate",
            "objects": objects,
            "estimated_bytes": estimated_bytes,
            "reserved_bytes": reserved_bytes
        }),
        BuildEvent::RegionPacked { region, used_bytes } => serde_json::json!({
            "type": "region_packed",
            "region": region,
            "used_bytes": used_bytes
        }),
        BuildEvent::ObjectNullified {
            address,
            kind,
            reason,
        } => serde_json::json!({
            "type": "object_nullified",
            "address": address,
            "kind": kind,
            "reason": reason
        }),
        BuildEvent::SubgraphArchived {
            holder,
            field,
            objects,
            classes,
        } => serde_json::json!({
            "type": "subgraph_archived",
            "holder": holder,
            "field": field,
            "objects": objects,
            "classes": classes
        }),
        BuildEvent::SubgraphAbandoned {
            holder,
            field,
            reason,
        } => serde_json::json!({
            "type": "subgraph_abandoned",
            "holder": holder,
            "field": field,
            "reason": reason
        }),
        BuildEvent::HeapRanges {
            kind,
            ranges,
            used_bytes,
        } => serde_json::json!({
            "type": "heap_ranges",
            "kind": kind,
            "ranges": ranges,
            "used_bytes": used_bytes
        }),
        BuildEvent::RelocationSummary {
            relocated,
            nulls_cleared,
            base_archive_pointers,
        } => serde_json::json!({
            "type": "relocation_summary",
            "relocated": relocated,
            "nulls_cleared": nulls_cleared,
            "base_archive_pointers": base_archive_pointers
        }),
        BuildEvent::ArchiveWritten {
            path,
            file_size,
            crc,
        } => serde_json::json!({
            "type": "archive_written",
            "path": path,
            "file_size": file_size,
            "crc": crc
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_filtered_by_level() {
        let logger = BuildLogger::new(BuildLoggerConfig {
            level: LogLevel::Warn,
            ..Default::default()
        });
        logger.log(BuildEvent::PhaseStart {
            phase: "gather".to_string(),
        });
        logger.log(BuildEvent::SubgraphAbandoned {
            holder: "Cache".to_string(),
            field: "VALUES".to_string(),
            reason: "too large".to_string(),
        });
        let events = logger.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], BuildEvent::SubgraphAbandoned { .. }));
    }

    #[test]
    fn test_phase_brackets_closure() {
        let logger = BuildLogger::default();
        let value = logger.phase("copy", || 7);
        assert_eq!(value, 7);
        let events = logger.events();
        assert!(matches!(&events[0], BuildEvent::PhaseStart { phase } if phase == "copy"));
        assert!(matches!(&events[1], BuildEvent::PhaseEnd { phase, .. } if phase == "copy"));
    }

    #[test]
    fn test_disabled_logger_records_nothing() {
        let logger = BuildLogger::default();
        logger.disable();
        logger.log(BuildEvent::PhaseStart {
            phase: "gather".to_string(),
        });
        assert!(logger.events().is_empty());
    }

    #[test]
    fn test_json_has_type_tag() {
        let value = json(&BuildEvent::RegionPacked {
            region: "rw".to_string(),
            used_bytes: 4096,
        });
        assert_eq!(value["type"], "region_packed");
        assert_eq!(value["used_bytes"], 4096);
    }
}
