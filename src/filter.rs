use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};

use crate::cache::TimestampIndex;
use crate::error::DateError;
use crate::session::Session;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    From,
    To,
}

impl Bound {
    pub fn label(self) -> &'static str {
        match self {
            Self::From => "from",
            Self::To => "to",
        }
    }
}

/// Turns a user-supplied date phrase into an instant.
pub trait DateResolver {
    fn resolve(&self, phrase: &str, now: DateTime<Utc>, bound: Bound) -> Option<DateTime<Utc>>;
}

/// Absolute dates plus a handful of relative phrases, all in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalDateResolver;

impl DateResolver for NaturalDateResolver {
    fn resolve(&self, phrase: &str, now: DateTime<Utc>, bound: Bound) -> Option<DateTime<Utc>> {
        let trimmed = phrase.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(instant) = DateTime::parse_from_rfc3339(trimmed) {
            return Some(instant.with_timezone(&Utc));
        }

        let lowered = trimmed.to_ascii_lowercase();
        match lowered.as_str() {
            "now" => return Some(now),
            "today" => return day_bound(now.date_naive(), bound),
            "yesterday" => return day_bound(now.date_naive().pred_opt()?, bound),
            _ => {}
        }

        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return day_bound(date, bound);
        }
        for format in DATETIME_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Some(naive.and_utc());
            }
        }
        relative_ago(&lowered, now, bound)
    }
}

fn day_bound(date: NaiveDate, bound: Bound) -> Option<DateTime<Utc>> {
    let naive = match bound {
        Bound::From => date.and_hms_opt(0, 0, 0)?,
        Bound::To => date.and_hms_nano_opt(23, 59, 59, 999_999_999)?,
    };
    Some(naive.and_utc())
}

/// `N minutes|hours|days|weeks ago`. Day and week offsets snap to day bounds like `yesterday`.
fn relative_ago(text: &str, now: DateTime<Utc>, bound: Bound) -> Option<DateTime<Utc>> {
    let mut parts = text.split_whitespace();
    let amount: i64 = parts.next()?.parse().ok()?;
    let unit = parts.next()?;
    if parts.next()? != "ago" || parts.next().is_some() {
        return None;
    }
    let (delta, whole_days) = match unit.trim_end_matches('s') {
        "minute" | "min" => (TimeDelta::try_minutes(amount)?, false),
        "hour" => (TimeDelta::try_hours(amount)?, false),
        "day" => (TimeDelta::try_days(amount)?, true),
        "week" => (TimeDelta::try_weeks(amount)?, true),
        _ => return None,
    };
    let instant = now.checked_sub_signed(delta)?;
    if whole_days {
        day_bound(instant.date_naive(), bound)
    } else {
        Some(instant)
    }
}

/// Closed interval; a missing bound is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<Self, DateError> {
        if let (Some(from), Some(to)) = (from, to)
            && from > to
        {
            return Err(DateError::InvertedRange {
                from: from.to_rfc3339(),
                to: to.to_rfc3339(),
            });
        }
        Ok(Self { from, to })
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Resolve both phrases. Any failure ends the request.
    pub fn resolve(
        from: Option<&str>,
        to: Option<&str>,
        resolver: &dyn DateResolver,
        now: DateTime<Utc>,
    ) -> Result<Self, DateError> {
        let resolve_bound = |phrase: Option<&str>, bound: Bound| match phrase {
            Some(phrase) => resolver
                .resolve(phrase, now, bound)
                .map(Some)
                .ok_or_else(|| DateError::Unresolved {
                    bound: bound.label(),
                    phrase: phrase.to_string(),
                }),
            None => Ok(None),
        };
        Self::new(resolve_bound(from, Bound::From)?, resolve_bound(to, Bound::To)?)
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| timestamp >= from) && self.to.is_none_or(|to| timestamp <= to)
    }

    /// Sessions the index places inside the interval; the coarse pass before loading records.
    pub fn candidate_sessions(&self, index: &TimestampIndex) -> BTreeSet<String> {
        index.sessions_between(self.from, self.to)
    }
}

/// Restrict each session to its records inside `range`, dropping sessions left empty.
/// Records without a timestamp fall outside any bounded range.
pub fn filter_sessions(
    sessions: BTreeMap<String, Session>,
    range: &DateRange,
    first_message_chars: usize,
) -> BTreeMap<String, Session> {
    if range.is_unbounded() {
        return sessions;
    }
    sessions
        .into_iter()
        .filter_map(|(id, session)| {
            session
                .retain_records(first_message_chars, |record| {
                    record.timestamp.is_some_and(|ts| range.contains(ts))
                })
                .map(|kept| (id, kept))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_line;
    use crate::session::{DEFAULT_FIRST_MESSAGE_CHARS, assemble_sessions};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 10, 15, 30, 0)
            .single()
            .expect("now")
    }

    fn resolve(phrase: &str, bound: Bound) -> Option<DateTime<Utc>> {
        NaturalDateResolver.resolve(phrase, now(), bound)
    }

    #[test]
    fn keeps_closed_interval_and_drops_empty_sessions() {
        let records = vec![
            parse_line(
                r#"{"type":"user","sessionId":"A","timestamp":"2025-06-01T10:00:00Z","message":{"content":"t0"}}"#,
                1,
            )
            .expect("t0"),
            parse_line(
                r#"{"type":"assistant","sessionId":"A","timestamp":"2025-06-01T11:00:00Z","message":{"content":[],"usage":{"input_tokens":3}}}"#,
                2,
            )
            .expect("t1"),
            parse_line(
                r#"{"type":"assistant","sessionId":"A","timestamp":"2025-06-01T12:00:00Z","message":{"content":[],"usage":{"input_tokens":7}}}"#,
                3,
            )
            .expect("t2 in A"),
            parse_line(
                r#"{"type":"user","sessionId":"B","timestamp":"2025-06-01T12:00:00Z","message":{"content":"t2"}}"#,
                4,
            )
            .expect("t2 in B"),
        ];
        let sessions = assemble_sessions(records, None, DEFAULT_FIRST_MESSAGE_CHARS);
        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).single();
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).single();
        let range = DateRange::new(t0, t1).expect("range");

        let filtered = filter_sessions(sessions, &range, DEFAULT_FIRST_MESSAGE_CHARS);
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["A"]);
        let a = &filtered["A"];
        assert_eq!(a.record_count(), 2);
        assert_eq!(a.first_timestamp, t0);
        assert_eq!(a.last_timestamp, t1);
        assert_eq!(a.tokens.input_tokens, 3);
    }

    #[test]
    fn unbounded_range_keeps_everything() {
        let records = vec![
            parse_line(
                r#"{"type":"other-kind","sessionId":"A","message":{}}"#,
                1,
            )
            .expect("record"),
        ];
        let sessions = assemble_sessions(records, None, DEFAULT_FIRST_MESSAGE_CHARS);
        let filtered = filter_sessions(
            sessions.clone(),
            &DateRange::unbounded(),
            DEFAULT_FIRST_MESSAGE_CHARS,
        );
        assert_eq!(filtered, sessions);
    }

    #[test]
    fn day_phrases_cover_whole_utc_day() {
        let from = resolve("2025-06-01", Bound::From).expect("from");
        let to = resolve("2025-06-01", Bound::To).expect("to");
        assert_eq!(from.to_rfc3339(), "2025-06-01T00:00:00+00:00");
        assert_eq!(to - from, TimeDelta::days(1) - TimeDelta::nanoseconds(1));

        assert_eq!(
            resolve("yesterday", Bound::From).map(|ts| ts.date_naive()),
            NaiveDate::from_ymd_opt(2025, 6, 9)
        );
        assert_eq!(
            resolve("today", Bound::To).map(|ts| ts.date_naive()),
            NaiveDate::from_ymd_opt(2025, 6, 10)
        );
    }

    #[test]
    fn absolute_and_relative_phrases() {
        assert_eq!(
            resolve("2025-06-01T08:00:00+02:00", Bound::From),
            Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).single()
        );
        assert_eq!(
            resolve("2025-06-01 08:15", Bound::From),
            Utc.with_ymd_and_hms(2025, 6, 1, 8, 15, 0).single()
        );
        assert_eq!(resolve("Now", Bound::To), Some(now()));
        assert_eq!(
            resolve("2 hours ago", Bound::From),
            Some(now() - TimeDelta::hours(2))
        );
        assert_eq!(
            resolve("1 week ago", Bound::From),
            Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).single()
        );
        assert_eq!(resolve("last tuesday", Bound::From), None);
        assert_eq!(resolve("3 fortnights ago", Bound::From), None);
        assert_eq!(resolve("", Bound::From), None);
    }

    #[test]
    fn days_ago_covers_the_whole_day() {
        assert_eq!(
            resolve("3 days ago", Bound::From),
            Utc.with_ymd_and_hms(2025, 6, 7, 0, 0, 0).single()
        );
        let to = resolve("3 days ago", Bound::To).expect("to");
        assert_eq!(
            to,
            Utc.with_ymd_and_hms(2025, 6, 8, 0, 0, 0).single().expect("midnight")
                - TimeDelta::nanoseconds(1)
        );
        assert_eq!(
            resolve("30 minutes ago", Bound::To),
            Some(now() - TimeDelta::minutes(30))
        );
    }

    #[test]
    fn unresolvable_phrase_is_an_error() {
        let err = DateRange::resolve(Some("whenever"), None, &NaturalDateResolver, now())
            .expect_err("should fail");
        assert!(matches!(err, DateError::Unresolved { bound: "from", .. }));
    }

    #[test]
    fn inverted_range_is_an_error() {
        let err = DateRange::resolve(
            Some("2025-06-02"),
            Some("2025-06-01"),
            &NaturalDateResolver,
            now(),
        )
        .expect_err("should fail");
        assert!(matches!(err, DateError::InvertedRange { .. }));
    }

    #[test]
    fn contains_is_inclusive_and_open_ended() {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).single().expect("t");
        assert!(DateRange::new(Some(t), Some(t)).expect("range").contains(t));
        assert!(DateRange::new(None, Some(t)).expect("range").contains(t));
        assert!(!DateRange::new(Some(t + TimeDelta::seconds(1)), None)
            .expect("range")
            .contains(t));
    }
}
