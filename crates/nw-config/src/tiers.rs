//! Error-report tiers: the priority thresholds and minimum spans that
//! drive the reporting gate.
//!
//! Each tier pairs a priority threshold with a span: once a run's highest
//! error priority reaches a tier, a report may fire at most once per that
//! tier's span. More severe tiers use shorter spans.

use nw_common::Priority;
use tracing::warn;

/// Seconds in a day.
const DAY: i64 = 86_400;

/// One report tier: fire for priorities at or above `priority`, at most
/// once per `span` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    pub priority: Priority,
    pub span: i64,
}

/// The three configured tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportTiers {
    pub low: Tier,
    pub medium: Tier,
    pub critical: Tier,
}

pub const DEFAULT_LOW: Tier = Tier { priority: 10, span: 7 * DAY };
pub const DEFAULT_MEDIUM: Tier = Tier { priority: 50, span: 3 * DAY };
pub const DEFAULT_CRITICAL: Tier = Tier { priority: 90, span: DAY };

impl Default for ReportTiers {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW,
            medium: DEFAULT_MEDIUM,
            critical: DEFAULT_CRITICAL,
        }
    }
}

impl ReportTiers {
    /// Span for a run whose highest error priority is `max_priority`.
    /// Callers are expected to have checked `max_priority >= low.priority`.
    pub fn span_for(&self, max_priority: Priority) -> i64 {
        if max_priority >= self.critical.priority {
            self.critical.span
        } else if max_priority >= self.medium.priority {
            self.medium.span
        } else {
            self.low.span
        }
    }
}

/// Parse one `"<priority>[,<span>]"` setting.
///
/// Out-of-range pieces are clamped with a warning and the default fills in
/// anything missing or unparsable.
fn parse_tier(
    name: &str,
    raw: Option<&str>,
    default: Tier,
    priority_max: Priority,
    span_min: i64,
) -> Tier {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return default;
    };

    let mut parts = raw.splitn(2, ',');
    let priority_str = parts.next().unwrap_or("").trim();
    let span_str = parts.next().map(str::trim);

    let mut priority = match priority_str.parse::<Priority>() {
        Ok(p) => p,
        Err(_) => {
            warn!(setting = name, value = raw, "tier priority is not a number, using default");
            default.priority
        }
    };
    if priority < 1 {
        warn!(setting = name, priority, "tier priority below 1, clamping");
        priority = 1;
    }
    if priority > priority_max {
        warn!(setting = name, priority, max = priority_max, "tier priority too high, clamping");
        priority = priority_max;
    }

    let mut span = match span_str {
        None | Some("") => default.span,
        Some(s) => match s.parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                warn!(setting = name, value = raw, "tier span is not a number, using default");
                default.span
            }
        },
    };
    if span < span_min {
        warn!(setting = name, span, min = span_min, "tier span too short, clamping");
        span = span_min;
    }

    Tier { priority, span }
}

/// Resolve the three tier settings into a consistent [`ReportTiers`].
///
/// The raw inputs are the `error-report-{low,medium,critical}-priority`
/// values (`None` when not configured). After individual clamping, the
/// cross-tier orderings `low <= medium <= critical` (priorities) and
/// `critical <= medium <= low` (spans) are restored: a violation resets
/// the side that was not explicitly configured to its default, and when
/// both sides were configured the lower tier wins and the other is
/// adjusted to match.
pub fn resolve_tiers(
    low_raw: Option<&str>,
    medium_raw: Option<&str>,
    critical_raw: Option<&str>,
) -> ReportTiers {
    let mut low = parse_tier("error-report-low-priority", low_raw, DEFAULT_LOW, 50, DAY);
    let mut medium = parse_tier(
        "error-report-medium-priority",
        medium_raw,
        DEFAULT_MEDIUM,
        100,
        3_600,
    );
    let mut critical = parse_tier(
        "error-report-critical-priority",
        critical_raw,
        DEFAULT_CRITICAL,
        100,
        300,
    );

    let low_explicit = low_raw.is_some();
    let medium_explicit = medium_raw.is_some();
    let critical_explicit = critical_raw.is_some();

    // priorities must be ordered low <= medium <= critical
    if medium.priority < low.priority {
        warn!(
            low = low.priority,
            medium = medium.priority,
            "medium report priority below low, restoring order"
        );
        if !medium_explicit {
            medium.priority = DEFAULT_MEDIUM.priority.max(low.priority);
        } else if !low_explicit {
            low.priority = DEFAULT_LOW.priority.min(medium.priority);
        } else {
            medium.priority = low.priority;
        }
    }
    if critical.priority < medium.priority {
        warn!(
            medium = medium.priority,
            critical = critical.priority,
            "critical report priority below medium, restoring order"
        );
        if !critical_explicit {
            critical.priority = DEFAULT_CRITICAL.priority.max(medium.priority);
        } else if !medium_explicit {
            medium.priority = medium.priority.min(critical.priority);
        } else {
            critical.priority = medium.priority;
        }
    }

    // spans must be ordered critical <= medium <= low
    if medium.span > low.span {
        warn!(
            low = low.span,
            medium = medium.span,
            "medium report span above low, restoring order"
        );
        if !medium_explicit {
            medium.span = DEFAULT_MEDIUM.span.min(low.span);
        } else if !low_explicit {
            low.span = DEFAULT_LOW.span.max(medium.span);
        } else {
            medium.span = low.span;
        }
    }
    if critical.span > medium.span {
        warn!(
            medium = medium.span,
            critical = critical.span,
            "critical report span above medium, restoring order"
        );
        if !critical_explicit {
            critical.span = DEFAULT_CRITICAL.span.min(medium.span);
        } else if !medium_explicit {
            medium.span = DEFAULT_MEDIUM.span.max(critical.span);
        } else {
            critical.span = medium.span;
        }
    }

    ReportTiers { low, medium, critical }
}
