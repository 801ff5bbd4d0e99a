//! Interpretation of provider rate-limit response headers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use reqwest::header::HeaderMap;

/// Window a provider quota applies to, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RateLimitScope {
    /// Per-minute quota.
    Minute,
    /// Per-hour quota.
    Hour,
    /// Per-day quota.
    Day,
}

impl RateLimitScope {
    /// Evaluation order used by [`RateLimitPolicy::decide`].
    pub const PRIORITY: [RateLimitScope; 3] =
        [RateLimitScope::Minute, RateLimitScope::Hour, RateLimitScope::Day];

    /// Header suffix used by providers for this scope.
    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitScope::Minute => "minute",
            RateLimitScope::Hour => "hour",
            RateLimitScope::Day => "day",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator should do about an exhausted quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitAction {
    /// Wait for the window to reset, then carry on.
    Sleep,
    /// Move to the next credential.
    RotateCredential,
}

/// Outcome of [`RateLimitPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// First exhausted scope in priority order.
    pub scope: RateLimitScope,
    /// Configured reaction for that scope.
    pub action: RateLimitAction,
    /// Delay before the quota resets (capped for [`RateLimitAction::Sleep`]).
    pub wait: Duration,
}

/// Maps exhausted quota scopes to actions.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    minute: RateLimitAction,
    hour: RateLimitAction,
    day: RateLimitAction,
    default_reset: Duration,
    max_sleep: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            minute: RateLimitAction::Sleep,
            hour: RateLimitAction::RotateCredential,
            day: RateLimitAction::RotateCredential,
            default_reset: Duration::from_secs(60),
            max_sleep: Duration::from_secs(60),
        }
    }
}

impl RateLimitPolicy {
    /// Overrides the action taken for one scope.
    pub fn with_action(mut self, scope: RateLimitScope, action: RateLimitAction) -> Self {
        match scope {
            RateLimitScope::Minute => self.minute = action,
            RateLimitScope::Hour => self.hour = action,
            RateLimitScope::Day => self.day = action,
        }
        self
    }

    /// Action configured for `scope`.
    pub fn action(&self, scope: RateLimitScope) -> RateLimitAction {
        match scope {
            RateLimitScope::Minute => self.minute,
            RateLimitScope::Hour => self.hour,
            RateLimitScope::Day => self.day,
        }
    }

    /// Returns the first exhausted scope, or `None` when quota remains.
    pub fn decide(&self, headers: &HeaderMap) -> Option<RateLimitDecision> {
        self.decide_parsed(&parse_rate_headers(headers))
    }

    /// Same as [`decide`](Self::decide) over already-parsed headers.
    pub fn decide_parsed(&self, parsed: &BTreeMap<String, i64>) -> Option<RateLimitDecision> {
        let generic_reset = lookup(parsed, &["ratelimit-reset", "x-ratelimit-reset"]);
        for scope in RateLimitScope::PRIORITY {
            let remaining = scoped(parsed, "remaining", scope).or_else(|| {
                (scope == RateLimitScope::Minute)
                    .then(|| lookup(parsed, &["ratelimit-remaining", "x-ratelimit-remaining"]))
                    .flatten()
            });
            let Some(remaining) = remaining else {
                continue;
            };
            if remaining > 0 {
                continue;
            }
            let reset = scoped(parsed, "reset", scope)
                .or(generic_reset)
                .map(|secs| Duration::from_secs(secs.max(0) as u64))
                .unwrap_or(self.default_reset);
            let action = self.action(scope);
            let wait = match action {
                RateLimitAction::Sleep => reset.min(self.max_sleep),
                RateLimitAction::RotateCredential => reset,
            };
            return Some(RateLimitDecision {
                scope,
                action,
                wait,
            });
        }
        None
    }
}

/// Collects every header whose lower-cased name contains `ratelimit` and whose
/// value parses as an integer.
pub fn parse_rate_headers(headers: &HeaderMap) -> BTreeMap<String, i64> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_ascii_lowercase();
            if !name.contains("ratelimit") {
                return None;
            }
            let value = value.to_str().ok()?.trim().parse::<i64>().ok()?;
            Some((name, value))
        })
        .collect()
}

fn scoped(parsed: &BTreeMap<String, i64>, field: &str, scope: RateLimitScope) -> Option<i64> {
    let plain = format!("ratelimit-{field}-{}", scope.as_str());
    let prefixed = format!("x-{plain}");
    lookup(parsed, &[prefixed.as_str(), plain.as_str()])
}

fn lookup(parsed: &BTreeMap<String, i64>, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|name| parsed.get(*name).copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).expect("header name"),
                HeaderValue::from_str(value).expect("header value"),
            );
        }
        map
    }

    #[test]
    fn minute_wins_over_hour() {
        let decision = RateLimitPolicy::default()
            .decide(&headers(&[
                ("X-RateLimit-Remaining-Minute", "0"),
                ("X-RateLimit-Remaining-Hour", "0"),
                ("X-RateLimit-Reset-Minute", "12"),
            ]))
            .expect("exhausted");
        assert_eq!(decision.scope, RateLimitScope::Minute);
        assert_eq!(decision.action, RateLimitAction::Sleep);
        assert_eq!(decision.wait, Duration::from_secs(12));
    }

    #[test]
    fn hour_exhaustion_rotates() {
        let decision = RateLimitPolicy::default()
            .decide(&headers(&[
                ("x-ratelimit-remaining-minute", "40"),
                ("x-ratelimit-remaining-hour", "0"),
                ("ratelimit-reset", "1800"),
            ]))
            .expect("exhausted");
        assert_eq!(decision.scope, RateLimitScope::Hour);
        assert_eq!(decision.action, RateLimitAction::RotateCredential);
        assert_eq!(decision.wait, Duration::from_secs(1800));
    }

    #[test]
    fn generic_remaining_stands_in_for_minute() {
        let decision = RateLimitPolicy::default()
            .decide(&headers(&[("RateLimit-Remaining", "0"), ("RateLimit-Reset", "600")]))
            .expect("exhausted");
        assert_eq!(decision.scope, RateLimitScope::Minute);
        assert_eq!(decision.wait, Duration::from_secs(60), "sleep is capped");
    }

    #[test]
    fn missing_reset_defaults_to_a_minute() {
        let decision = RateLimitPolicy::default()
            .decide(&headers(&[("x-ratelimit-remaining-day", "-1")]))
            .expect("exhausted");
        assert_eq!(decision.scope, RateLimitScope::Day);
        assert_eq!(decision.wait, Duration::from_secs(60));
    }

    #[test]
    fn unparseable_and_unrelated_headers_are_ignored() {
        let map = headers(&[
            ("x-ratelimit-remaining-minute", "soon"),
            ("content-type", "application/json"),
            ("x-ratelimit-limit-minute", "100"),
        ]);
        let parsed = parse_rate_headers(&map);
        assert_eq!(parsed.len(), 1);
        assert_eq!(RateLimitPolicy::default().decide(&map), None);
    }
}
