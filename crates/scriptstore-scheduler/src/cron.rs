//! Standard 5-field crontab expressions.
//!
//! `MIN HOUR DOM MON DOW`, each field a comma list of `*`, `N` or `A-B`,
//! optionally followed by `/STEP`. Day-of-week accepts 0-7 with both 0 and 7
//! meaning Sunday. If either day field starts with `*` a day must match
//! both; otherwise matching either is enough. All times are UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};

/// How far ahead [`CronExpression::next_after`] searches before giving up.
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

/// Field bounds: (name, min, max).
const MINUTE: (&str, u32, u32) = ("minute", 0, 59);
const HOUR: (&str, u32, u32) = ("hour", 0, 23);
const DAY_OF_MONTH: (&str, u32, u32) = ("day-of-month", 1, 31);
const MONTH: (&str, u32, u32) = ("month", 1, 12);
const DAY_OF_WEEK: (&str, u32, u32) = ("day-of-week", 0, 7);

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// Field starts with `*` (including `*/N`); drives the DOM/DOW rule.
    star: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }

    fn parse(raw: &str, (name, min, max): (&str, u32, u32)) -> Result<Self, String> {
        let mut bits = 0u64;
        for item in raw.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("invalid step '{step}' in {name} field"))?;
                    if step == 0 {
                        return Err(format!("step must be positive in {name} field"));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (lo, hi) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                let (a, b) = (number(a, name)?, number(b, name)?);
                if a > b {
                    return Err(format!("descending range '{range}' in {name} field"));
                }
                (a, b)
            } else {
                let n = number(range, name)?;
                // `N/STEP` runs from N to the end of the field.
                (n, if step.is_some() { max } else { n })
            };

            if lo < min || hi > max {
                return Err(format!(
                    "{name} value out of range in '{item}' (allowed {min}-{max})"
                ));
            }
            let step = step.unwrap_or(1) as usize;
            for v in (lo..=hi).step_by(step) {
                bits |= 1u64 << v;
            }
        }
        Ok(Self {
            bits,
            star: raw.starts_with('*'),
        })
    }
}

fn number(raw: &str, name: &str) -> Result<u32, String> {
    raw.parse()
        .map_err(|_| format!("invalid value '{raw}' in {name} field"))
}

/// A parsed, validated cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [min, hour, dom, mon, dow] = fields.as_slice() else {
            return Err(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            ));
        };

        let mut days_of_week = Field::parse(dow, DAY_OF_WEEK)?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week.bits |= 1;
            days_of_week.bits &= !(1u64 << 7);
        }

        Ok(Self {
            source: fields.join(" "),
            minutes: Field::parse(min, MINUTE)?,
            hours: Field::parse(hour, HOUR)?,
            days_of_month: Field::parse(dom, DAY_OF_MONTH)?,
            months: Field::parse(mon, MONTH)?,
            days_of_week,
        })
    }

    /// Normalized source text (fields separated by single spaces).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Does `date` satisfy the day-of-month / day-of-week fields?
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.days_of_month.star || self.days_of_week.star {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// First fire time strictly after `after`, at minute resolution.
    ///
    /// `None` if nothing matches within five years (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = after + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = start;

        while t <= horizon {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = midnight(t.date_naive().succ_opt()?);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).map(midnight)
}

impl FromStr for CronExpression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        CronExpression::parse(expr)
            .unwrap()
            .next_after(after)
            .unwrap()
    }

    #[test]
    fn top_of_every_hour() {
        assert_eq!(next("0 * * * *", at(2026, 2, 22, 10, 30)), at(2026, 2, 22, 11, 0));
        // strictly after: a fire time equal to `after` is skipped
        assert_eq!(next("0 * * * *", at(2026, 2, 22, 11, 0)), at(2026, 2, 22, 12, 0));
    }

    #[test]
    fn every_five_minutes() {
        assert_eq!(next("*/5 * * * *", at(2026, 2, 22, 10, 2)), at(2026, 2, 22, 10, 5));
        assert_eq!(next("*/5 * * * *", at(2026, 2, 22, 10, 58)), at(2026, 2, 22, 11, 0));
    }

    #[test]
    fn seconds_are_ignored() {
        let after = Utc.with_ymd_and_hms(2026, 2, 22, 10, 4, 59).unwrap();
        assert_eq!(next("*/5 * * * *", after), at(2026, 2, 22, 10, 5));
    }

    #[test]
    fn lists_and_ranges() {
        let expr = "15,45 9-17 * * *";
        assert_eq!(next(expr, at(2026, 3, 2, 8, 0)), at(2026, 3, 2, 9, 15));
        assert_eq!(next(expr, at(2026, 3, 2, 9, 15)), at(2026, 3, 2, 9, 45));
        assert_eq!(next(expr, at(2026, 3, 2, 17, 45)), at(2026, 3, 3, 9, 15));
    }

    #[test]
    fn range_with_step() {
        assert_eq!(next("0 8-18/4 * * *", at(2026, 3, 2, 12, 30)), at(2026, 3, 2, 16, 0));
        assert_eq!(next("10/20 * * * *", at(2026, 3, 2, 12, 31)), at(2026, 3, 2, 12, 50));
    }

    #[test]
    fn weekdays_and_sunday_aliases() {
        // 2026-03-02 is a Monday.
        assert_eq!(next("0 9 * * 1-5", at(2026, 3, 6, 10, 0)), at(2026, 3, 9, 9, 0));
        assert_eq!(next("0 0 * * 0", at(2026, 3, 2, 0, 0)), at(2026, 3, 8, 0, 0));
        assert_eq!(next("0 0 * * 7", at(2026, 3, 2, 0, 0)), at(2026, 3, 8, 0, 0));
    }

    #[test]
    fn day_of_month_or_day_of_week() {
        // 1st of the month OR any Friday; 2026-03-06 is a Friday.
        let expr = "0 0 1 * 5";
        assert_eq!(next(expr, at(2026, 3, 2, 0, 0)), at(2026, 3, 6, 0, 0));
        assert_eq!(next(expr, at(2026, 3, 27, 0, 0)), at(2026, 4, 1, 0, 0));
    }

    #[test]
    fn stepped_star_day_fields_narrow_the_match() {
        // 2026-03-01 is a Sunday.
        assert_eq!(next("0 0 */2 * *", at(2026, 3, 1, 0, 0)), at(2026, 3, 3, 0, 0));
        assert_eq!(next("0 0 */2 * *", at(2026, 3, 31, 0, 0)), at(2026, 4, 1, 0, 0));
        assert_eq!(next("0 0 * * */2", at(2026, 3, 1, 0, 0)), at(2026, 3, 3, 0, 0));
        assert_eq!(next("0 0 * * */2", at(2026, 3, 3, 0, 0)), at(2026, 3, 5, 0, 0));
    }

    #[test]
    fn day_range_with_weekday_step() {
        // `1/2` is Mon, Wed, Fri and Sun (7); either field may match.
        let expr = "0 0 1-7 * 1/2";
        assert_eq!(next(expr, at(2026, 3, 7, 0, 0)), at(2026, 3, 8, 0, 0));
        assert_eq!(next(expr, at(2026, 3, 8, 0, 0)), at(2026, 3, 9, 0, 0));
        assert_eq!(next(expr, at(2026, 3, 9, 0, 0)), at(2026, 3, 11, 0, 0));

        // A star-prefixed weekday step requires both fields.
        let expr = "0 0 1-7 * */2";
        assert_eq!(next(expr, at(2026, 3, 1, 0, 0)), at(2026, 3, 3, 0, 0));
        assert_eq!(next(expr, at(2026, 3, 7, 0, 0)), at(2026, 4, 2, 0, 0));
    }

    #[test]
    fn month_and_leap_day() {
        assert_eq!(next("30 6 1 1 *", at(2026, 3, 2, 0, 0)), at(2027, 1, 1, 6, 30));
        assert_eq!(next("0 0 29 2 *", at(2026, 3, 1, 0, 0)), at(2028, 2, 29, 0, 0));
    }

    #[test]
    fn impossible_date_never_fires() {
        let expr = CronExpression::parse("0 0 30 2 *").unwrap();
        assert!(expr.next_after(at(2026, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "bad",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
            "1,,2 * * * *",
        ] {
            assert!(CronExpression::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn display_is_normalized() {
        let expr: CronExpression = "  */5   *  * * *".parse().unwrap();
        assert_eq!(expr.to_string(), "*/5 * * * *");
    }
}
