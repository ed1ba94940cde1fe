//! # drift-match
//!
//! The file-name matcher used by distribution rules.
//!
//! Patterns are globs (`*`, `?`) with three extensions:
//!
//! - `%t<X>` expands a time field (year, month, day, ...) of the match
//!   time before matching,
//! - `%T<sign><n><unit>` shifts the time base for subsequent `%t`
//!   tokens,
//! - a leading `!` inverts the pattern, which is how exclude lists are
//!   built.
//!
//! Matching backtracks through a single saved gap position, so it stays
//! polynomial in pattern and name length.

use chrono::{DateTime, Datelike, Months, TimeDelta, Timelike, Utc};

/// Outcome of a [`pmatch`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The pattern matches the name.
    Match,
    /// The pattern is inverse (`!`-prefixed) and its body matches.
    InverseMatch,
    /// No match.
    NoMatch,
}

impl MatchResult {
    /// Classic integer form: 0 match, 1 inverse match, -1 no match.
    pub fn as_i32(self) -> i32 {
        match self {
            MatchResult::Match => 0,
            MatchResult::InverseMatch => 1,
            MatchResult::NoMatch => -1,
        }
    }
}

/// Match `name` against `pattern` at time `when` (default: now).
pub fn pmatch(pattern: &str, name: &str, when: Option<DateTime<Utc>>) -> MatchResult {
    let when = when.unwrap_or_else(Utc::now);

    let (inverse, body) = match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern),
    };

    let expanded = expand_time(body, when);
    let hit = glob_match(expanded.as_bytes(), name.as_bytes());

    match (inverse, hit) {
        (false, true) => MatchResult::Match,
        (true, true) => MatchResult::InverseMatch,
        _ => MatchResult::NoMatch,
    }
}

/// Expand `%t`, `%T` and `%h` tokens in `pattern` against `base`.
///
/// Malformed tokens are kept literally; expansion never fails.
pub fn expand_time(pattern: &str, base: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut now = base;
    let bytes = pattern.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'%' || i + 1 >= bytes.len() {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        match bytes[i + 1] {
            b't' if i + 2 < bytes.len() => {
                if let Some(s) = expand_field(bytes[i + 2], now) {
                    out.push_str(&s);
                    i += 3;
                } else {
                    out.push('%');
                    i += 1;
                }
            }
            b'T' => {
                if let Some((shifted, used)) = apply_shift(&bytes[i + 2..], now) {
                    now = shifted;
                    i += 2 + used;
                } else {
                    out.push('%');
                    i += 1;
                }
            }
            b'h' => {
                out.push_str(&hostname());
                i += 2;
            }
            _ => {
                out.push('%');
                i += 1;
            }
        }
    }
    out
}

fn expand_field(field: u8, t: DateTime<Utc>) -> Option<String> {
    const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    Some(match field {
        b'Y' => format!("{:04}", t.year()),
        b'y' => format!("{:02}", t.year() % 100),
        b'm' => format!("{:02}", t.month()),
        b'd' => format!("{:02}", t.day()),
        b'j' => format!("{:03}", t.ordinal()),
        b'H' => format!("{:02}", t.hour()),
        b'M' => format!("{:02}", t.minute()),
        b'S' => format!("{:02}", t.second()),
        b'U' => format!("{}", t.timestamp()),
        b'a' => WEEKDAYS[t.weekday().num_days_from_monday() as usize].to_string(),
        b'b' => MONTHS[t.month0() as usize].to_string(),
        _ => return None,
    })
}

/// Parse `<sign><n><unit>` and shift `t`; returns the shifted time and
/// the number of pattern bytes consumed.
fn apply_shift(rest: &[u8], t: DateTime<Utc>) -> Option<(DateTime<Utc>, usize)> {
    let mut i = 0;
    let sign = match rest.first()? {
        b'+' => 1i64,
        b'-' => -1i64,
        _ => return None,
    };
    i += 1;

    let start = i;
    while i < rest.len() && rest[i].is_ascii_digit() {
        i += 1;
    }
    if i == start {
        return None;
    }
    let n: i64 = std::str::from_utf8(&rest[start..i]).ok()?.parse().ok()?;
    let amount = sign * n;

    let unit = *rest.get(i)?;
    i += 1;

    let shifted = match unit {
        b'S' => t.checked_add_signed(TimeDelta::seconds(amount))?,
        b'M' => t.checked_add_signed(TimeDelta::minutes(amount))?,
        b'H' => t.checked_add_signed(TimeDelta::hours(amount))?,
        b'd' => t.checked_add_signed(TimeDelta::days(amount))?,
        b'm' => {
            if amount >= 0 {
                t.checked_add_months(Months::new(amount as u32))?
            } else {
                t.checked_sub_months(Months::new((-amount) as u32))?
            }
        }
        b'y' => {
            if amount >= 0 {
                t.checked_add_months(Months::new(amount as u32 * 12))?
            } else {
                t.checked_sub_months(Months::new((-amount) as u32 * 12))?
            }
        }
        _ => return None,
    };
    Some((shifted, i))
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default()
}

/// Glob match with one saved gap position.
fn glob_match(pat: &[u8], name: &[u8]) -> bool {
    let mut p = 0;
    let mut n = 0;
    let mut gap: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pat.len() && (pat[p] == b'?' || pat[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pat.len() && pat[p] == b'*' {
            gap = Some((p + 1, n));
            p += 1;
        } else if let Some((gp, gn)) = gap {
            // Retry from the gap, one name byte further.
            p = gp;
            n = gn + 1;
            gap = Some((gp, gn + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_plain_globs() {
        assert_eq!(pmatch("*.txt", "report.txt", None), MatchResult::Match);
        assert_eq!(pmatch("data_??.bin", "data_07.bin", None), MatchResult::Match);
        assert_eq!(pmatch("data_??.bin", "data_007.bin", None), MatchResult::NoMatch);
        assert_eq!(pmatch("*", "", None), MatchResult::Match);
        assert_eq!(pmatch("a*b*c", "axxbyyc", None), MatchResult::Match);
        assert_eq!(pmatch("a*b*c", "axxbyy", None), MatchResult::NoMatch);
    }

    #[test]
    fn test_gap_backtracking_is_not_greedy_to_death() {
        // The second '*' retry must recover after a false partial match.
        assert_eq!(pmatch("*ab*ab", "xabxabab", None), MatchResult::Match);
        assert_eq!(pmatch("*aab", "aaab", None), MatchResult::Match);
    }

    #[test]
    fn test_pathological_pattern_terminates() {
        let pattern = "*a*a*a*a*a*a*a*a*a*a";
        let name = "a".repeat(64);
        assert_eq!(pmatch(pattern, &name, None), MatchResult::Match);
        let miss = format!("{}b", "a".repeat(64));
        assert_eq!(pmatch(&format!("{pattern}c"), &miss, None), MatchResult::NoMatch);
    }

    #[test]
    fn test_time_expansion() {
        let when = at(2024, 3, 15, 0, 0, 0);
        assert_eq!(
            pmatch("report_%tY%tm%td*.txt", "report_20240315_final.txt", Some(when)),
            MatchResult::Match
        );
        assert_eq!(
            pmatch("!report_%tY%tm%td*.txt", "report_20240315_final.txt", Some(when)),
            MatchResult::InverseMatch
        );
    }

    #[test]
    fn test_time_shift_applies_to_following_tokens() {
        let when = at(2024, 3, 15, 12, 0, 0);
        // Shift back one day: the %td after it must render 14.
        assert_eq!(expand_time("%T-1d%tY%tm%td", when), "20240314");
        // Shift forward crosses the month.
        assert_eq!(expand_time("%T+17d%tm%td", when), "0401");
    }

    #[test]
    fn test_day_of_year_and_unix_fields() {
        let when = at(2024, 2, 1, 3, 4, 5);
        assert_eq!(expand_time("%tj", when), "032");
        assert_eq!(expand_time("%tU", when), when.timestamp().to_string());
        assert_eq!(expand_time("%ta", when), "Thu");
        assert_eq!(expand_time("%tb", when), "Feb");
    }

    #[test]
    fn test_malformed_tokens_stay_literal() {
        let when = at(2024, 1, 1, 0, 0, 0);
        assert_eq!(expand_time("%tQ", when), "%tQ");
        assert_eq!(expand_time("100%", when), "100%");
        assert_eq!(expand_time("%Tx5d", when), "%Tx5d");
    }

    #[test]
    fn test_inverse_non_match_is_no_match() {
        assert_eq!(pmatch("!*.tmp", "keep.dat", None), MatchResult::NoMatch);
    }

    #[test]
    fn test_integer_form() {
        assert_eq!(pmatch("*", "x", None).as_i32(), 0);
        assert_eq!(pmatch("!*", "x", None).as_i32(), 1);
        assert_eq!(pmatch("a", "b", None).as_i32(), -1);
    }
}
