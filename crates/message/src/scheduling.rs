use chrono::naive::{NaiveDate, NaiveTime};
use chrono::{DateTime, Datelike, Days, FixedOffset, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

fn short_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

/// The set of weekdays on which dispatch is permitted.
/// The serialized form is a comma separated list like "Mon,Wed";
/// parsing accepts whatever chrono accepts for a weekday name, so
/// "monday" and "MON" also work.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DaySet(u8);

impl DaySet {
    pub const EMPTY: Self = Self(0);

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_monday()
    }

    pub fn with(mut self, day: Weekday) -> Self {
        self.0 |= Self::bit(day);
        self
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }
}

impl FromStr for DaySet {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String> {
        let mut set = Self::EMPTY;
        for token in s.split(',') {
            let day = token
                .trim()
                .parse::<Weekday>()
                .map_err(|_| format!("invalid day '{token}'"))?;
            set = set.with(day);
        }
        Ok(set)
    }
}

impl TryFrom<String> for DaySet {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> {
        s.parse()
    }
}

impl From<DaySet> for String {
    fn from(set: DaySet) -> String {
        let names: Vec<&str> = WEEK
            .into_iter()
            .filter(|day| set.contains(*day))
            .map(short_name)
            .collect();
        names.join(",")
    }
}

impl std::fmt::Debug for DaySet {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "DaySet({})", String::from(*self))
    }
}

/// Restricts when a message is permitted to be dispatched: on the
/// listed days, between the start and end times of day, evaluated
/// in the given timezone
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Copy)]
pub struct ScheduleRestriction {
    #[serde(rename = "dow")]
    pub days: DaySet,
    #[serde(rename = "tz")]
    pub timezone: Tz,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleRestriction {
    /// The permitted window on the given local calendar date.
    /// None when the timezone cannot unambiguously represent one of
    /// the bounds on that date, eg: a DST transition swallowed it.
    fn window_on(&self, date: NaiveDate) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
        let open = self
            .timezone
            .from_local_datetime(&date.and_time(self.start))
            .single()?;
        let close = self
            .timezone
            .from_local_datetime(&date.and_time(self.end))
            .single()?;
        Some((open, close))
    }
}

/// Constrains the delivery schedule for a message.
/// `first_attempt` delays the initial dispatch; `expires` overrides
/// the queue max_age for this message; `restriction` holds each
/// computed due time to a permitted window.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Copy, Default)]
pub struct Scheduling {
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub restriction: Option<ScheduleRestriction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_attempt: Option<DateTime<FixedOffset>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<FixedOffset>>,
}

impl Scheduling {
    /// Move `due` forward to the next permitted dispatch time.
    /// A due time already inside a permitted window is unchanged.
    pub fn adjust_for_schedule(&self, due: DateTime<Utc>) -> DateTime<Utc> {
        let due = match &self.first_attempt {
            Some(first) if due < *first => (*first).into(),
            _ => due,
        };

        let Some(restrict) = &self.restriction else {
            return due;
        };
        let local = due.with_timezone(&restrict.timezone);

        // Walk forward one calendar day at a time. Any full week
        // contains a permitted day, so eight dates cover every case,
        // including a window lost to a DST transition on the first
        // permitted day.
        for offset in 0..8 {
            let Some(date) = local.date_naive().checked_add_days(Days::new(offset)) else {
                continue;
            };
            if !restrict.days.contains(date.weekday()) {
                continue;
            }
            let Some((open, close)) = restrict.window_on(date) else {
                continue;
            };
            if local < open {
                // Hold until the window opens; on any later date this
                // is the path that lands on the day's start time
                return open.with_timezone(&Utc);
            }
            if local < close {
                // Already within the permitted window
                return due;
            }
            // Past the close on the due date itself; consider the
            // following dates
        }

        due
    }

    pub fn is_within_schedule(&self, dt: DateTime<Utc>) -> bool {
        if matches!(&self.first_attempt, Some(first) if dt < *first) {
            return false;
        }

        match &self.restriction {
            None => true,
            Some(restrict) => {
                let local = dt.with_timezone(&restrict.timezone);
                restrict.days.contains(local.weekday())
                    && restrict
                        .window_on(local.date_naive())
                        .map(|(open, close)| local >= open && local < close)
                        .unwrap_or(false)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn weekdays() -> DaySet {
        DaySet::EMPTY
            .with(Weekday::Mon)
            .with(Weekday::Tue)
            .with(Weekday::Wed)
            .with(Weekday::Thu)
            .with(Weekday::Fri)
    }

    #[test]
    fn day_set_parsing() {
        let all: DaySet = "Mon,Tue,Wed,Thu,Fri,Sat,Sun".parse().unwrap();
        for day in WEEK {
            assert!(all.contains(day));
        }

        let middle: DaySet = "Wed,Tue,Thursday".parse().unwrap();
        assert!(middle.contains(Weekday::Tue));
        assert!(middle.contains(Weekday::Wed));
        assert!(middle.contains(Weekday::Thu));
        assert!(!middle.contains(Weekday::Mon));
        assert!(!middle.contains(Weekday::Sun));
        k9::assert_equal!(String::from(middle), "Tue,Wed,Thu");

        k9::assert_equal!(
            "Wed,Sumday".parse::<DaySet>().unwrap_err(),
            "invalid day 'Sumday'"
        );

        let weekend: DaySet = "sat,SUN".parse().unwrap();
        assert!(weekend.contains(Weekday::Sat));
        assert!(weekend.contains(Weekday::Sun));
        assert!(!weekend.contains(Weekday::Fri));
    }

    #[test]
    fn schedule_serde_round_trip() {
        let sched = Scheduling {
            restriction: Some(ScheduleRestriction {
                days: DaySet::EMPTY.with(Weekday::Mon).with(Weekday::Wed),
                timezone: "America/Phoenix".parse().unwrap(),
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            }),
            first_attempt: None,
            expires: None,
        };

        let serialized = serde_json::to_string(&sched).unwrap();
        k9::snapshot!(
            &serialized,
            r#"{"dow":"Mon,Wed","tz":"America/Phoenix","start":"09:00:00","end":"17:00:00"}"#
        );

        let round_trip: Scheduling = serde_json::from_str(&serialized).unwrap();
        k9::assert_equal!(sched, round_trip);
    }

    #[test]
    fn first_attempt_defers_the_initial_dispatch() {
        let sched = Scheduling {
            restriction: None,
            first_attempt: DateTime::parse_from_rfc3339("2023-03-20T16:39:57-08:00").ok(),
            expires: None,
        };

        let now: DateTime<Utc> = DateTime::parse_from_rfc3339("2023-03-20T08:00:00-08:00")
            .unwrap()
            .into();
        k9::assert_equal!(sched.adjust_for_schedule(now), sched.first_attempt.unwrap());

        // past the first_attempt instant nothing is adjusted
        let later = now + chrono::TimeDelta::days(2);
        k9::assert_equal!(sched.adjust_for_schedule(later), later);
    }

    #[test]
    fn due_on_disallowed_day_rolls_to_next_window() {
        let phoenix: Tz = "America/Phoenix".parse().unwrap();
        let sched = Scheduling {
            restriction: Some(ScheduleRestriction {
                days: DaySet::EMPTY.with(Weekday::Mon).with(Weekday::Wed),
                timezone: phoenix,
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            }),
            first_attempt: None,
            expires: None,
        };

        // This is a Tuesday
        let now: DateTime<Utc> = DateTime::parse_from_rfc3339("2023-03-28T08:00:00-08:00")
            .unwrap()
            .into();

        let adjusted = sched.adjust_for_schedule(now).with_timezone(&phoenix);
        // Expected to roll into Wednesday, the next day
        k9::assert_equal!(adjusted.to_string(), "2023-03-29 09:00:00 MST");
        assert!(sched.is_within_schedule(adjusted.with_timezone(&Utc)));
    }

    #[test]
    fn due_after_hours_rolls_past_disallowed_days() {
        let phoenix: Tz = "America/Phoenix".parse().unwrap();
        let sched = Scheduling {
            restriction: Some(ScheduleRestriction {
                days: DaySet::EMPTY.with(Weekday::Mon).with(Weekday::Fri),
                timezone: phoenix,
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            }),
            first_attempt: None,
            expires: None,
        };

        // This is a Monday, but after hours
        let now: DateTime<Utc> = DateTime::parse_from_rfc3339("2023-03-27T18:00:00-08:00")
            .unwrap()
            .into();

        let adjusted = sched.adjust_for_schedule(now).with_timezone(&phoenix);
        // Expected to roll into Friday, later that week
        k9::assert_equal!(adjusted.to_string(), "2023-03-31 09:00:00 MST");
    }

    #[test]
    fn due_inside_the_window_is_unchanged() {
        let phoenix: Tz = "America/Phoenix".parse().unwrap();
        let sched = Scheduling {
            restriction: Some(ScheduleRestriction {
                days: weekdays(),
                timezone: phoenix,
                start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            }),
            first_attempt: None,
            expires: None,
        };

        // Wednesday, mid-window in Phoenix
        let now: DateTime<Utc> = DateTime::parse_from_rfc3339("2023-03-29T12:00:00-07:00")
            .unwrap()
            .into();
        k9::assert_equal!(sched.adjust_for_schedule(now), now);
        assert!(sched.is_within_schedule(now));
    }
}
