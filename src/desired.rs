//! Desired monitor specs and metric naming.
//!
//! The configuration-sync collaborator hands over a batch of tag strings of
//! the form `filepath=<path>,keywords=<pattern>`. Each one describes a
//! (file, pattern) pair that should be monitored. The tag is kept verbatim
//! because it is part of every emitted metric name.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{LogmonError, ValidationError};

/// Metric prefix for every value produced by the engine.
pub const METRIC_PREFIX: &str = "log.monitor";

/// Separator between the metric prefix and the tag in a rule name.
pub const NAME_SEPARATOR: &str = "--------";

const FILEPATH_FIELD: &str = "filepath=";
const KEYWORDS_FIELD: &str = "keywords=";

/// One desired (file, pattern) monitoring unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitorSpec {
    /// File to follow.
    pub file_path: PathBuf,
    /// Pattern as configured (escapes not yet resolved).
    pub pattern: String,
    /// Verbatim label attached to emitted metrics.
    pub tag: String,
}

impl MonitorSpec {
    /// Builds a spec and its canonical tag from a path and a pattern.
    #[must_use]
    pub fn new(file_path: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        let file_path = file_path.into();
        let pattern = pattern.into();
        let tag = format!("{FILEPATH_FIELD}{},{KEYWORDS_FIELD}{pattern}", file_path.display());
        Self {
            file_path,
            pattern,
            tag,
        }
    }

    /// Pattern with doubled backslashes collapsed, ready to compile.
    #[must_use]
    pub fn compiled_pattern(&self) -> String {
        unescape_pattern(&self.pattern)
    }

    /// Rule/metric name for this spec.
    #[must_use]
    pub fn metric_name(&self) -> String {
        metric_name(&self.tag)
    }
}

impl fmt::Display for MonitorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// Parses a `filepath=<path>,keywords=<pattern>` tag.
///
/// `keywords=` consumes the rest of the tag, so a pattern may itself contain
/// commas. Both values are trimmed and must be non-empty.
///
/// # Errors
///
/// Returns `ValidationError::InvalidTag` when a field is missing or empty.
///
/// # Examples
///
/// ```
/// use logmon::desired::parse_tag;
///
/// let spec = parse_tag("filepath=/var/log/app.log,keywords=ERROR").unwrap();
/// assert_eq!(spec.file_path.to_str(), Some("/var/log/app.log"));
/// assert_eq!(spec.pattern, "ERROR");
/// ```
pub fn parse_tag(tag: &str) -> Result<MonitorSpec, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidTag {
        tag: tag.to_string(),
        reason: reason.to_string(),
    };

    if tag.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }

    let mut file_path: Option<&str> = None;
    let mut pattern: Option<&str> = None;
    let mut rest = tag.trim();

    while !rest.is_empty() {
        if let Some(value) = rest.strip_prefix(KEYWORDS_FIELD) {
            pattern = Some(value.trim());
            break;
        }
        let (field, tail) = rest.split_once(',').unwrap_or((rest, ""));
        if let Some(value) = field.strip_prefix(FILEPATH_FIELD) {
            file_path = Some(value.trim());
        }
        rest = tail.trim_start();
    }

    let file_path = file_path
        .filter(|p| !p.is_empty())
        .ok_or_else(|| invalid("missing filepath"))?;
    let pattern = pattern
        .filter(|p| !p.is_empty())
        .ok_or_else(|| invalid("missing keywords"))?;

    Ok(MonitorSpec {
        file_path: PathBuf::from(file_path),
        pattern: pattern.to_string(),
        tag: tag.trim().to_string(),
    })
}

/// Outcome of parsing a batch of tags keyed by an opaque identifier.
#[derive(Debug, Default)]
pub struct ParsedBatch {
    /// Successfully parsed specs, deduplicated on (file, pattern).
    pub specs: Vec<MonitorSpec>,
    /// Entries that failed to parse, by identifier.
    pub rejected: BTreeMap<String, LogmonError>,
}

/// Parses every tag in `batch`; malformed entries are reported, not fatal.
pub fn parse_batch<'a, I>(batch: I) -> ParsedBatch
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = ParsedBatch::default();
    for (id, tag) in batch {
        match parse_tag(tag) {
            Ok(spec) => {
                let seen = out
                    .specs
                    .iter()
                    .any(|s| s.file_path == spec.file_path && s.pattern == spec.pattern);
                if !seen {
                    out.specs.push(spec);
                }
            }
            Err(e) => {
                out.rejected.insert(id.to_string(), e.into());
            }
        }
    }
    out
}

/// Collapses `\\` into `\`.
#[must_use]
pub fn unescape_pattern(pattern: &str) -> String {
    pattern.replace("\\\\", "\\")
}

/// `log.monitor--------<tag>`.
#[must_use]
pub fn metric_name(tag: &str) -> String {
    format!("{METRIC_PREFIX}{NAME_SEPARATOR}{tag}")
}

/// Splits a rule name back into `(metric, tag)`.
#[must_use]
pub fn split_metric_name(name: &str) -> (&str, &str) {
    name.split_once(NAME_SEPARATOR).unwrap_or((name, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tag_basic() {
        let spec = parse_tag("filepath=/opt/app/log/app.log,keywords=\\[W\\]").unwrap();
        assert_eq!(spec.file_path, PathBuf::from("/opt/app/log/app.log"));
        assert_eq!(spec.pattern, "\\[W\\]");
        assert_eq!(spec.tag, "filepath=/opt/app/log/app.log,keywords=\\[W\\]");
    }

    #[test]
    fn test_parse_tag_trims_values() {
        let spec = parse_tag("filepath= /var/log/a.log ,keywords= ERROR ").unwrap();
        assert_eq!(spec.file_path, PathBuf::from("/var/log/a.log"));
        assert_eq!(spec.pattern, "ERROR");
    }

    #[test]
    fn test_parse_tag_pattern_may_contain_commas() {
        let spec = parse_tag("filepath=/var/log/a.log,keywords=a{1,3}b").unwrap();
        assert_eq!(spec.pattern, "a{1,3}b");
    }

    #[test]
    fn test_parse_tag_rejects_missing_fields() {
        assert!(matches!(
            parse_tag("keywords=ERROR"),
            Err(ValidationError::InvalidTag { .. })
        ));
        assert!(matches!(
            parse_tag("filepath=/var/log/a.log"),
            Err(ValidationError::InvalidTag { .. })
        ));
        assert!(matches!(
            parse_tag("filepath=,keywords=ERROR"),
            Err(ValidationError::InvalidTag { .. })
        ));
        assert!(parse_tag("").is_err());
    }

    #[test]
    fn test_parse_tag_rejects_nul_bytes() {
        let err = parse_tag("filepath=/var/log/a.log,keywords=ab\0c").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTag { .. }));
        assert!(format!("{err}").contains("NUL"));
    }

    #[test]
    fn test_unescape_pattern() {
        assert_eq!(unescape_pattern("\\\\d+"), "\\d+");
        assert_eq!(unescape_pattern("\\d+"), "\\d+");
        let spec = MonitorSpec::new("/tmp/x.log", "\\\\[E\\\\]");
        assert_eq!(spec.compiled_pattern(), "\\[E\\]");
    }

    #[test]
    fn test_metric_name_round_trip() {
        let tag = "filepath=/var/log/a.log,keywords=ERROR";
        let name = metric_name(tag);
        assert_eq!(name, "log.monitor--------filepath=/var/log/a.log,keywords=ERROR");
        assert_eq!(split_metric_name(&name), (METRIC_PREFIX, tag));
    }

    #[test]
    fn test_monitor_spec_new_builds_canonical_tag() {
        let spec = MonitorSpec::new("/var/log/a.log", "ERROR");
        assert_eq!(spec.tag, "filepath=/var/log/a.log,keywords=ERROR");
        assert_eq!(parse_tag(&spec.tag).unwrap(), spec);
    }

    #[test]
    fn test_parse_batch_reports_rejects_and_dedupes() {
        let batch = [
            ("1", "filepath=/a.log,keywords=ERROR"),
            ("2", "filepath=/a.log,keywords=ERROR"),
            ("3", "garbage"),
            ("4", "filepath=/b.log,keywords=WARN"),
        ];
        let parsed = parse_batch(batch);
        assert_eq!(parsed.specs.len(), 2);
        assert_eq!(parsed.rejected.len(), 1);
        assert!(parsed.rejected.contains_key("3"));
    }
}
