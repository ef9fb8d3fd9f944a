use chrono::{DateTime, Datelike, Days, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone};

use crate::alarm::model::{Alarm, WeekDays};

/// Firing phase of one alarm occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmPhase {
    Scheduled,
    Active,
    Stopped,
}

impl AlarmPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            AlarmPhase::Scheduled => "SCHEDULED",
            AlarmPhase::Active => "ACTIVE",
            AlarmPhase::Stopped => "STOPPED",
        }
    }
}

/// The schedule-relevant fields of an alarm. Two notifications carrying the
/// same key never move the alarm's next occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleKey {
    pub enabled: bool,
    pub one_time_only: bool,
    pub time: NaiveTime,
    pub week_days: WeekDays,
}

impl From<&Alarm> for ScheduleKey {
    fn from(alarm: &Alarm) -> Self {
        Self {
            enabled: alarm.enabled,
            one_time_only: alarm.one_time_only,
            time: alarm.time,
            week_days: alarm.week_days,
        }
    }
}

/// First occurrence of the alarm strictly after `now`, in local time.
pub fn next_occurrence_local(alarm: &Alarm, now: &DateTime<Local>) -> Option<DateTime<Local>> {
    next_occurrence_for_alarm_in_tz(alarm, now, &Local)
}

pub(crate) fn next_occurrence_for_alarm_in_tz<Tz>(
    alarm: &Alarm,
    now: &DateTime<Tz>,
    timezone: &Tz,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    // A one-time alarm fires at the next time the clock shows its time.
    let days = if alarm.one_time_only {
        WeekDays::all()
    } else {
        alarm.week_days
    };
    next_recurring_occurrence(days, alarm.time, now, timezone)
}

fn resolve_local_datetime<Tz>(timezone: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    match timezone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}

fn next_recurring_occurrence<Tz>(
    days: WeekDays,
    time_local: NaiveTime,
    now: &DateTime<Tz>,
    timezone: &Tz,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    if days.is_empty() {
        return None;
    }

    for day_offset in 0_u64..14 {
        let date = now.date_naive().checked_add_days(Days::new(day_offset))?;
        if !days.contains(date.weekday()) {
            continue;
        }
        let naive = date.and_time(time_local);
        let candidate = match resolve_local_datetime(timezone, naive) {
            Some(value) => value,
            None => continue,
        };

        if candidate > *now {
            return Some(candidate);
        }
    }

    None
}
