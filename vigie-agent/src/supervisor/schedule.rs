/**
 * SCHEDULE - Expressions de planification des collecteurs
 *
 * FORMAT : `<dow> <days> <hours> <minutes> <seconds>`, `*` = non renseigné
 *
 * - `* * * * *`  → continu (relancé seulement après un échec)
 * - `* * * 5 0`  → toutes les 5 minutes, à la seconde 0
 * - `* 1 3 0 0`  → tous les jours à 03:00:00
 * - `2 * 8 0 0`  → tous les lundis à 08:00:00 (1 = dimanche … 7 = samedi)
 *
 * Le premier champ renseigné donne la période ("toutes les N unités"),
 * les suivants donnent l'heure d'alignement.
 */

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("expected 5 fields (<dow> <days> <hours> <minutes> <seconds>), got {0}")]
    FieldCount(usize),
    #[error("invalid value {value:?} for {field}")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u32 },
    #[error("day of week cannot be combined with a day interval")]
    WeekdayWithDays,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Second,
    Minute,
    Hour,
    Day,
}

impl Period {
    /// Intervalle maximal accepté : dix ans, quelle que soit l'unité
    fn max_count(&self) -> u32 {
        match self {
            Period::Second => 315_360_000,
            Period::Minute => 5_256_000,
            Period::Hour => 87_600,
            Period::Day => 3_650,
        }
    }

    fn duration(&self, count: u32) -> Duration {
        let count = i64::from(count);
        match self {
            Period::Second => Duration::seconds(count),
            Period::Minute => Duration::minutes(count),
            Period::Hour => Duration::hours(count),
            Period::Day => Duration::days(count),
        }
    }
}

/// Heure d'alignement; seuls les champs plus fins que la période comptent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    fn on(&self, date: NaiveDate) -> NaiveDateTime {
        let time = NaiveTime::from_hms_opt(self.hour, self.minute, self.second).unwrap_or_default();
        date.and_time(time)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Continuous,
    Every { period: Period, count: u32, at: TimeOfDay },
    Weekly { weekday: Weekday, at: TimeOfDay },
}

const FIELDS: [&str; 5] = ["day of week", "days", "hours", "minutes", "seconds"];

fn parse_field(field: &'static str, raw: &str) -> Result<Option<u32>, ScheduleError> {
    if raw == "*" {
        return Ok(None);
    }
    raw.parse::<u32>()
        .map(Some)
        .map_err(|_| ScheduleError::InvalidValue {
            field,
            value: raw.to_string(),
        })
}

fn check_range(field: &'static str, value: u32, max: u32) -> Result<u32, ScheduleError> {
    if value > max {
        return Err(ScheduleError::OutOfRange { field, value });
    }
    Ok(value)
}

fn weekday_from_number(n: u32) -> Result<Weekday, ScheduleError> {
    Ok(match n {
        1 => Weekday::Sun,
        2 => Weekday::Mon,
        3 => Weekday::Tue,
        4 => Weekday::Wed,
        5 => Weekday::Thu,
        6 => Weekday::Fri,
        7 => Weekday::Sat,
        _ => return Err(ScheduleError::OutOfRange { field: FIELDS[0], value: n }),
    })
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let raw: Vec<&str> = expr.split_whitespace().collect();
        if raw.len() != FIELDS.len() {
            return Err(ScheduleError::FieldCount(raw.len()));
        }

        let mut values = [None; 5];
        for (i, value) in raw.iter().enumerate() {
            values[i] = parse_field(FIELDS[i], value)?;
        }
        let [dow, days, hours, minutes, seconds] = values;

        if let Some(dow) = dow {
            if days.is_some() {
                return Err(ScheduleError::WeekdayWithDays);
            }
            let at = TimeOfDay {
                hour: check_range(FIELDS[2], hours.unwrap_or(0), 23)?,
                minute: check_range(FIELDS[3], minutes.unwrap_or(0), 59)?,
                second: check_range(FIELDS[4], seconds.unwrap_or(0), 59)?,
            };
            return Ok(Schedule::Weekly {
                weekday: weekday_from_number(dow)?,
                at,
            });
        }

        let periods = [Period::Day, Period::Hour, Period::Minute, Period::Second];
        let interval = [days, hours, minutes, seconds];

        let Some(first) = interval.iter().position(|value| value.is_some()) else {
            return Ok(Schedule::Continuous);
        };

        let period = periods[first];
        let field = FIELDS[first + 1];
        let count = interval[first].unwrap_or(0);
        if count == 0 || count > period.max_count() {
            return Err(ScheduleError::OutOfRange { field, value: count });
        }

        // Champs d'alignement : uniquement ceux qui suivent la période
        let at_field = |index: usize, value: Option<u32>, max: u32| -> Result<u32, ScheduleError> {
            if index <= first {
                return Ok(0);
            }
            check_range(FIELDS[index + 1], value.unwrap_or(0), max)
        };
        let at = TimeOfDay {
            hour: at_field(1, hours, 23)?,
            minute: at_field(2, minutes, 59)?,
            second: at_field(3, seconds, 59)?,
        };

        Ok(Schedule::Every { period, count, at })
    }
}

impl Schedule {
    pub fn is_continuous(&self) -> bool {
        matches!(self, Schedule::Continuous)
    }

    /// Prochaine échéance strictement après `now`; None pour un job continu
    /// ou si l'échéance sort du calendrier représentable
    pub fn next_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        match *self {
            Schedule::Continuous => None,
            Schedule::Every { period, count, at } => {
                let from = now.checked_add_signed(period.duration(count - 1))?;
                align(from, period, at)
            }
            Schedule::Weekly { weekday, at } => {
                let today = now.date().weekday().num_days_from_sunday() as i64;
                let target = weekday.num_days_from_sunday() as i64;
                let ahead = (target - today).rem_euclid(7);
                let next = at.on(now.date().checked_add_signed(Duration::days(ahead))?);
                if next <= now {
                    next.checked_add_signed(Duration::days(7))
                } else {
                    Some(next)
                }
            }
        }
    }
}

/// Premier instant aligné sur `period` strictement après `t`
fn align(t: NaiveDateTime, period: Period, at: TimeOfDay) -> Option<NaiveDateTime> {
    let date = t.date();
    let candidate = match period {
        Period::Second => {
            let second = TimeOfDay {
                hour: t.hour(),
                minute: t.minute(),
                second: t.second(),
            };
            second.on(date)
        }
        Period::Minute => TimeOfDay {
            hour: t.hour(),
            minute: t.minute(),
            second: at.second,
        }
        .on(date),
        Period::Hour => TimeOfDay {
            hour: t.hour(),
            minute: at.minute,
            second: at.second,
        }
        .on(date),
        Period::Day => at.on(date),
    };

    if candidate > t {
        Some(candidate)
    } else {
        candidate.checked_add_signed(period.duration(1))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Continuous => write!(f, "continuous"),
            Schedule::Every { period, count, at } => {
                let unit = match period {
                    Period::Second => "s",
                    Period::Minute => "m",
                    Period::Hour => "h",
                    Period::Day => "d",
                };
                write!(
                    f,
                    "every {}{} at {:02}:{:02}:{:02}",
                    count, unit, at.hour, at.minute, at.second
                )
            }
            Schedule::Weekly { weekday, at } => write!(
                f,
                "every {} at {:02}:{:02}:{:02}",
                weekday, at.hour, at.minute, at.second
            ),
        }
    }
}
