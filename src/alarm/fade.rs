//! Volume and brightness curves of an active alarm, as functions of the
//! seconds elapsed since activation.

use crate::alarm::model::Alarm;

/// Sound volume in percent.
///
/// Ramps linearly from `volume_fade_in_start` to `volume_fade_in_end` over
/// the fade-in and holds `volume_alarm_end` once the fade-in is over. A zero
/// fade-in starts at `volume_fade_in_end`.
pub fn volume_at(alarm: &Alarm, elapsed: u32) -> u8 {
    if alarm.fade_in_duration == 0 && elapsed == 0 {
        return to_percent(f64::from(alarm.volume_fade_in_end));
    }
    if elapsed >= alarm.fade_in_duration {
        return to_percent(f64::from(alarm.volume_alarm_end));
    }
    let ratio = f64::from(elapsed) / f64::from(alarm.fade_in_duration);
    to_percent(lerp(
        f64::from(alarm.volume_fade_in_start),
        f64::from(alarm.volume_fade_in_end),
        ratio,
    ))
}

/// Light brightness in percent.
pub fn brightness_at(alarm: &Alarm, elapsed: u32) -> f64 {
    let target = f64::from(alarm.light_dim_up_brightness);
    if alarm.light_dim_up_duration == 0 {
        return target;
    }
    let ratio = (f64::from(elapsed) / f64::from(alarm.light_dim_up_duration)).min(1.0);
    target * ratio
}

/// Number of reminder points passed after `elapsed` seconds.
///
/// Reminders fall every `reminder_interval` seconds after the fade-in ends
/// and strictly before the alarm duration.
pub fn reminders_due(alarm: &Alarm, elapsed: u32) -> u32 {
    if alarm.reminder_interval == 0 || alarm.duration == 0 {
        return 0;
    }
    let upto = elapsed.min(alarm.duration - 1);
    if upto < alarm.fade_in_duration {
        return 0;
    }
    (upto - alarm.fade_in_duration) / alarm.reminder_interval
}

fn lerp(from: f64, to: f64, ratio: f64) -> f64 {
    from + (to - from) * ratio
}

fn to_percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}
