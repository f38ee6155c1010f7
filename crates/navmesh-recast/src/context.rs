//! Build context collecting diagnostics and stage timings
//!
//! Every entry is forwarded to the `log` facade as it is recorded and kept
//! in memory so that callers can retrieve the build log afterwards.

use std::collections::HashMap;
use std::time::Duration;
use web_time::Instant;

/// Log level for context messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Progress and informational messages
    Progress = 0,
    /// Warning messages
    Warning = 1,
    /// Error messages
    Error = 2,
}

/// Timer categories for the build stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerCategory {
    /// Total navigation mesh generation time
    Total,
    /// Heightfield rasterization
    Rasterization,
    /// Heightfield filtering
    Filtering,
    /// Compact heightfield building
    CompactHeightfield,
    /// Erosion, median filter and convex volume marking
    AreaMarking,
    /// Distance field and region building
    Regions,
    /// Contour extraction
    Contours,
    /// Polygon mesh generation
    PolyMesh,
    /// Detail mesh generation
    DetailMesh,
    /// Navigation mesh data creation
    NavMeshData,
}

/// Log entry containing message and metadata
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level
    pub level: LogLevel,
    /// Timestamp when log was created
    pub timestamp: Instant,
    /// Log message
    pub message: String,
}

impl LogEntry {
    /// Formats the entry the way the text log presents it.
    pub fn to_line(&self) -> String {
        match self.level {
            LogLevel::Progress => self.message.clone(),
            LogLevel::Warning => format!("WARNING: {}", self.message),
            LogLevel::Error => format!("ERROR: {}", self.message),
        }
    }
}

/// Context for build operations providing logging and profiling
#[derive(Debug)]
pub struct BuildContext {
    logs: Vec<LogEntry>,
    active_timers: HashMap<TimerCategory, Instant>,
    timers: HashMap<TimerCategory, Duration>,
    max_log_entries: usize,
}

impl Default for BuildContext {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildContext {
    /// Creates an empty context
    pub fn new() -> Self {
        Self {
            logs: Vec::new(),
            active_timers: HashMap::new(),
            timers: HashMap::new(),
            max_log_entries: 1000,
        }
    }

    /// Logs a progress message
    pub fn log_progress(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        self.push(LogLevel::Progress, message);
    }

    /// Logs a warning message
    pub fn log_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{message}");
        self.push(LogLevel::Warning, message);
    }

    /// Logs an error message
    pub fn log_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::error!("{message}");
        self.push(LogLevel::Error, message);
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            timestamp: Instant::now(),
            message,
        });
        if self.logs.len() > self.max_log_entries {
            self.logs.remove(0);
        }
    }

    /// Starts a timer for the given category
    pub fn start_timer(&mut self, category: TimerCategory) {
        self.active_timers.insert(category, Instant::now());
    }

    /// Stops a timer and accumulates its duration
    pub fn stop_timer(&mut self, category: TimerCategory) {
        if let Some(start) = self.active_timers.remove(&category) {
            *self.timers.entry(category).or_default() += start.elapsed();
        }
    }

    /// Accumulated duration of a stage
    pub fn timer_duration(&self, category: TimerCategory) -> Option<Duration> {
        self.timers.get(&category).copied()
    }

    /// Clears accumulated timings
    pub fn reset_timers(&mut self) {
        self.active_timers.clear();
        self.timers.clear();
    }

    /// Gets all log entries
    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Counts entries of one level
    pub fn count(&self, level: LogLevel) -> usize {
        self.logs.iter().filter(|e| e.level == level).count()
    }

    /// Returns the log as text, one entry per line, and clears it.
    pub fn take_log_text(&mut self) -> String {
        let text = self
            .logs
            .iter()
            .map(LogEntry::to_line)
            .collect::<Vec<_>>()
            .join("\n");
        self.logs.clear();
        text
    }

    /// Clears all logs
    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_log_clears() {
        let mut ctx = BuildContext::new();
        ctx.log_progress("rasterized 2 triangles");
        ctx.log_warning("no walkable area");
        ctx.log_error("bad");
        assert_eq!(ctx.count(LogLevel::Warning), 1);

        let text = ctx.take_log_text();
        assert_eq!(
            text,
            "rasterized 2 triangles\nWARNING: no walkable area\nERROR: bad"
        );
        assert!(ctx.logs().is_empty());
        assert_eq!(ctx.take_log_text(), "");
    }

    #[test]
    fn test_timers_accumulate() {
        let mut ctx = BuildContext::new();
        ctx.start_timer(TimerCategory::Regions);
        ctx.stop_timer(TimerCategory::Regions);
        ctx.start_timer(TimerCategory::Regions);
        ctx.stop_timer(TimerCategory::Regions);
        assert!(ctx.timer_duration(TimerCategory::Regions).is_some());
        assert!(ctx.timer_duration(TimerCategory::Contours).is_none());
        ctx.stop_timer(TimerCategory::Contours);
        assert!(ctx.timer_duration(TimerCategory::Contours).is_none());
    }
}
