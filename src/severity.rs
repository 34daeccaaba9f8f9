use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;

/// Importance of a log entry, ordered from `Default` (least severe) to `Alert`.
///
/// The names match Cloud Logging's `LogSeverity` values. `Critical` is what a
/// fatal log call produces and `Alert` is what a panic-level call produces.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    Default,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Alert,
}

impl Severity {
    pub const ALL: [Severity; 7] = [
        Severity::Default,
        Severity::Debug,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Critical,
        Severity::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Default => "DEFAULT",
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
            Severity::Alert => "ALERT",
        }
    }

    /// The [`LevelFilter`] letting through exactly the `tracing` levels at or
    /// above this severity.
    ///
    /// `tracing` has nothing above `ERROR`, so a Critical or Alert minimum
    /// turns `tracing` events off entirely.
    pub fn level_filter(&self) -> LevelFilter {
        match self {
            Severity::Default => LevelFilter::TRACE,
            Severity::Debug => LevelFilter::DEBUG,
            Severity::Info => LevelFilter::INFO,
            Severity::Warning => LevelFilter::WARN,
            Severity::Error => LevelFilter::ERROR,
            Severity::Critical | Severity::Alert => LevelFilter::OFF,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEFAULT" => Ok(Severity::Default),
            "TRACE" | "DEBUG" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "WARN" | "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "FATAL" | "CRITICAL" => Ok(Severity::Critical),
            "PANIC" | "ALERT" => Ok(Severity::Alert),
            _ => Err(Error::InvalidSeverity(s.to_string())),
        }
    }
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE | Level::DEBUG => Severity::Debug,
            Level::INFO => Severity::Info,
            Level::WARN => Severity::Warning,
            Level::ERROR => Severity::Error,
        }
    }
}

impl From<LevelFilter> for Severity {
    fn from(filter: LevelFilter) -> Self {
        match filter.into_level() {
            Some(level) => level.into(),
            // OFF: nothing below Alert gets through.
            None => Severity::Alert,
        }
    }
}

/// Highest severity seen so far within one request.
///
/// Not shared between requests, so it needs no synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityTracker {
    max: Severity,
}

impl SeverityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, severity: Severity) {
        if severity > self.max {
            self.max = severity;
        }
    }

    pub fn max(&self) -> Severity {
        self.max
    }
}

/// Highest severity of entries reaching one request from any thread, such as
/// `tracing` events raised inside its span.
#[derive(Debug, Clone, Default)]
pub(crate) struct SharedSeverity(Arc<AtomicU8>);

impl SharedSeverity {
    pub(crate) fn record(&self, severity: Severity) {
        self.0.fetch_max(severity as u8, Ordering::Relaxed);
    }

    pub(crate) fn max(&self) -> Severity {
        let index = usize::from(self.0.load(Ordering::Relaxed));
        Severity::ALL.get(index).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        for pair in Severity::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{} < {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_severity_from_str() {
        assert_eq!("warn".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!("Fatal".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("panic".parse::<Severity>().unwrap(), Severity::Alert);
        assert_eq!(" info ".parse::<Severity>().unwrap(), Severity::Info);
        assert!("verbose".parse::<Severity>().is_err());
        for severity in Severity::ALL {
            assert_eq!(severity.as_str().parse::<Severity>().unwrap(), severity);
        }
    }

    #[test]
    fn test_severity_serde() {
        let json = serde_json::to_string(&Severity::Warning).unwrap();
        assert_eq!(json, "\"WARNING\"");
        let parsed: Severity = serde_json::from_str("\"CRITICAL\"").unwrap();
        assert_eq!(parsed, Severity::Critical);
    }

    #[test]
    fn test_tracing_level_mapping() {
        assert_eq!(Severity::from(Level::TRACE), Severity::Debug);
        assert_eq!(Severity::from(Level::WARN), Severity::Warning);
        assert_eq!(Severity::from(LevelFilter::ERROR), Severity::Error);
        assert_eq!(Severity::from(LevelFilter::OFF), Severity::Alert);
        assert_eq!(Severity::Warning.level_filter(), LevelFilter::WARN);
        assert_eq!(Severity::Error.level_filter(), LevelFilter::ERROR);
        assert_eq!(Severity::Critical.level_filter(), LevelFilter::OFF);
    }

    #[test]
    fn test_level_filter_never_admits_lower_severity() {
        let levels = [Level::TRACE, Level::DEBUG, Level::INFO, Level::WARN, Level::ERROR];
        for minimum in Severity::ALL {
            for level in levels {
                if minimum.level_filter() >= level {
                    assert!(Severity::from(level) >= minimum, "{minimum} admits {level}");
                }
            }
        }
    }

    #[test]
    fn test_tracker_starts_at_default() {
        assert_eq!(SeverityTracker::new().max(), Severity::Default);
    }

    #[test]
    fn test_tracker_all_pairs() {
        for a in Severity::ALL {
            for b in Severity::ALL {
                let mut tracker = SeverityTracker::new();
                tracker.record(a);
                tracker.record(b);
                assert_eq!(tracker.max(), a.max(b), "record({a}); record({b})");
            }
        }
    }

    #[test]
    fn test_shared_severity_across_threads() {
        let shared = SharedSeverity::default();
        assert_eq!(shared.max(), Severity::Default);
        let handles: Vec<_> = Severity::ALL
            .into_iter()
            .rev()
            .map(|severity| {
                let shared = shared.clone();
                std::thread::spawn(move || shared.record(severity))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(shared.max(), Severity::Alert);
    }

    #[test]
    fn test_tracker_idempotent() {
        for severity in Severity::ALL {
            let mut tracker = SeverityTracker::new();
            tracker.record(severity);
            let once = tracker;
            tracker.record(severity);
            assert_eq!(tracker, once);
        }
    }
}
