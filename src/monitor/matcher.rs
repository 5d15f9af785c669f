//! Line matching for rules.
//!
//! A `LineMatcher` owns one compiled pattern. Patterns without a group named
//! `count` count whole matches; patterns with one parse the captured text as
//! a number and contribute that value instead.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Name of the capture group whose text is parsed as the matched value.
pub const VALUE_GROUP: &str = "count";

/// How a rule turns its accumulated values into one number per cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    /// Total of all contributions in the cycle.
    #[default]
    Sum,
    /// Mean of the captured values in the cycle (0 when nothing matched).
    Avg,
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => f.write_str("sum"),
            Self::Avg => f.write_str("avg"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            other => Err(ValidationError::UnknownAggregation {
                kind: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchMode {
    Whole,
    Captured { group: usize },
}

/// A compiled rule pattern.
#[derive(Debug, Clone)]
pub struct LineMatcher {
    regex: Regex,
    mode: MatchMode,
}

impl LineMatcher {
    /// Compiles `pattern`.
    ///
    /// Only a group named `count` switches to value capture. Any other
    /// pattern, including one with differently named groups, counts whole
    /// matches.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidPattern` if the pattern does not compile.
    pub fn new(pattern: &str) -> Result<Self, ValidationError> {
        let regex = Regex::new(pattern).map_err(|e| ValidationError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let mode = regex
            .capture_names()
            .position(|name| name == Some(VALUE_GROUP))
            .map_or(MatchMode::Whole, |group| MatchMode::Captured { group });
        Ok(Self { regex, mode })
    }

    /// Whether the pattern captures a value rather than counting matches.
    #[must_use]
    pub fn captures_value(&self) -> bool {
        matches!(self.mode, MatchMode::Captured { .. })
    }

    /// The source pattern.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Evaluates one line.
    ///
    /// Returns `Some(1.0)` for a whole match, `Some(v)` for a captured value
    /// that parses as a float, and `None` otherwise.
    #[must_use]
    pub fn evaluate(&self, line: &str) -> Option<f64> {
        match self.mode {
            MatchMode::Whole => self.regex.is_match(line).then_some(1.0),
            MatchMode::Captured { group } => {
                let caps = self.regex.captures(line)?;
                caps.get(group)?.as_str().trim().parse::<f64>().ok()
            }
        }
    }
}

/// Per-cycle accumulation state of one rule.
#[derive(Debug, Clone)]
pub(crate) struct Accumulator {
    aggregation: Aggregation,
    value: f64,
    hits: u64,
}

impl Accumulator {
    pub(crate) const fn new(aggregation: Aggregation) -> Self {
        Self {
            aggregation,
            value: 0.0,
            hits: 0,
        }
    }

    pub(crate) fn observe(&mut self, matcher: &LineMatcher, line: &str) {
        if let Some(v) = matcher.evaluate(line) {
            self.value += v;
            self.hits += 1;
        }
    }

    /// Produces the cycle value and resets.
    pub(crate) fn flush(&mut self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let out = match self.aggregation {
            Aggregation::Sum => self.value,
            Aggregation::Avg if self.hits == 0 => 0.0,
            Aggregation::Avg => self.value / self.hits as f64,
        };
        self.value = 0.0;
        self.hits = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_match_counts_lines() {
        let matcher = LineMatcher::new("ERROR").unwrap();
        assert!(!matcher.captures_value());

        let mut acc = Accumulator::new(Aggregation::Sum);
        for line in ["ERROR a", "INFO b", "x ERROR y", "ERROR ERROR"] {
            acc.observe(&matcher, line);
        }
        assert_eq!(acc.flush(), 3.0);
        assert_eq!(acc.flush(), 0.0);
    }

    #[test]
    fn test_captured_value_sum() {
        let matcher = LineMatcher::new(r"took (?P<count>\d+(\.\d+)?)ms").unwrap();
        assert!(matcher.captures_value());

        let mut acc = Accumulator::new(Aggregation::Sum);
        acc.observe(&matcher, "req took 10ms");
        acc.observe(&matcher, "req took 2.5ms");
        acc.observe(&matcher, "unrelated");
        assert_eq!(acc.flush(), 12.5);
    }

    #[test]
    fn test_captured_value_avg() {
        let matcher = LineMatcher::new(r"latency=(?P<count>\d+)").unwrap();
        let mut acc = Accumulator::new(Aggregation::Avg);
        for line in ["latency=10", "latency=20", "latency=60"] {
            acc.observe(&matcher, line);
        }
        assert_eq!(acc.flush(), 30.0);
    }

    #[test]
    fn test_avg_without_hits_is_zero() {
        let mut acc = Accumulator::new(Aggregation::Avg);
        assert_eq!(acc.flush(), 0.0);
    }

    #[test]
    fn test_unparseable_capture_is_ignored() {
        let matcher = LineMatcher::new(r"v=(?P<count>\S+)").unwrap();
        let mut acc = Accumulator::new(Aggregation::Avg);
        acc.observe(&matcher, "v=abc");
        acc.observe(&matcher, "v=4");
        assert_eq!(acc.flush(), 4.0);
    }

    #[test]
    fn test_unnamed_groups_still_count_whole_matches() {
        let matcher = LineMatcher::new(r"(WARN|ERROR)").unwrap();
        assert!(!matcher.captures_value());
        assert_eq!(matcher.evaluate("a WARN"), Some(1.0));
        assert_eq!(matcher.evaluate("a INFO"), None);
    }

    #[test]
    fn test_other_named_groups_count_whole_matches() {
        let matcher = LineMatcher::new(r"user=(?P<user>\w+)").unwrap();
        assert!(!matcher.captures_value());
        assert_eq!(matcher.evaluate("login user=bob"), Some(1.0));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let err = LineMatcher::new("(unclosed").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPattern { .. }));
    }

    #[test]
    fn test_aggregation_parse_and_display() {
        assert_eq!("sum".parse::<Aggregation>().unwrap(), Aggregation::Sum);
        assert_eq!(" AVG ".parse::<Aggregation>().unwrap(), Aggregation::Avg);
        assert!("max".parse::<Aggregation>().is_err());
        assert_eq!(Aggregation::Avg.to_string(), "avg");
    }
}
