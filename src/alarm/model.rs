use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// One wake-up alarm: schedule, fade configuration and selected outputs.
///
/// The `id` is assigned by the store on creation and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub id: u32,
    pub enabled: bool,
    pub one_time_only: bool,
    pub skip_once: bool,
    pub time: NaiveTime,
    pub week_days: WeekDays,
    pub sound_id: Option<usize>,
    /// Lights driven by this alarm. Empty means every configured light.
    pub light_ids: Vec<u32>,
    pub greeting: String,
    pub fade_in_duration: u32,
    pub duration: u32,
    pub reminder_interval: u32,
    pub volume_fade_in_start: u8,
    pub volume_fade_in_end: u8,
    pub volume_alarm_end: u8,
    pub light_dim_up_duration: u32,
    pub light_dim_up_brightness: u8,
}

impl Alarm {
    /// Alarm used as the template for newly created alarms. Id 0 is never
    /// handed out by the store.
    pub fn template(settings: &AlarmSettings) -> Self {
        Self {
            id: 0,
            enabled: true,
            one_time_only: false,
            skip_once: false,
            time: NaiveTime::MIN,
            week_days: WeekDays::empty(),
            sound_id: None,
            light_ids: Vec::new(),
            greeting: settings.greeting.clone(),
            fade_in_duration: settings.fade_in,
            duration: settings.duration,
            reminder_interval: settings.reminder_interval,
            volume_fade_in_start: settings.volume_fade_in_start,
            volume_fade_in_end: settings.volume_fade_in_end,
            volume_alarm_end: settings.volume_alarm_end,
            light_dim_up_duration: settings.light_dim_up_duration,
            light_dim_up_brightness: settings.light_dim_up_brightness,
        }
    }

    pub fn applies_to_light(&self, light_id: u32) -> bool {
        self.light_ids.is_empty() || self.light_ids.contains(&light_id)
    }
}

/// Fade and duration defaults applied to every alarm.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AlarmSettings {
    pub greeting: String,
    pub fade_in: u32,
    pub duration: u32,
    pub reminder_interval: u32,
    pub volume_fade_in_start: u8,
    pub volume_fade_in_end: u8,
    pub volume_alarm_end: u8,
    pub light_dim_up_duration: u32,
    pub light_dim_up_brightness: u8,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            greeting: String::new(),
            fade_in: 300,
            duration: 1800,
            reminder_interval: 300,
            volume_fade_in_start: 10,
            volume_fade_in_end: 60,
            volume_alarm_end: 70,
            light_dim_up_duration: 600,
            light_dim_up_brightness: 50,
        }
    }
}

/// Set of week days, stored as a bit mask indexed from Monday.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct WeekDays(u8);

const ALL_WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl WeekDays {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0b0111_1111)
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= Self::bit(day);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Days in calendar order, Monday first.
    pub fn iter(self) -> impl Iterator<Item = Weekday> {
        ALL_WEEKDAYS.into_iter().filter(move |day| self.contains(*day))
    }

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_monday()
    }
}

impl FromIterator<Weekday> for WeekDays {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut days = Self::empty();
        for day in iter {
            days.insert(day);
        }
        days
    }
}

impl fmt::Debug for WeekDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for WeekDays {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.iter().map(weekday_name).collect::<Vec<_>>();
        write!(f, "[{}]", names.join(","))
    }
}

impl TryFrom<Vec<String>> for WeekDays {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names
            .iter()
            .map(|name| parse_weekday(name).ok_or_else(|| format!("invalid week day '{name}'")))
            .collect()
    }
}

impl From<WeekDays> for Vec<String> {
    fn from(days: WeekDays) -> Self {
        days.iter().map(|day| weekday_name(day).to_string()).collect()
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "MONDAY",
        Weekday::Tue => "TUESDAY",
        Weekday::Wed => "WEDNESDAY",
        Weekday::Thu => "THURSDAY",
        Weekday::Fri => "FRIDAY",
        Weekday::Sat => "SATURDAY",
        Weekday::Sun => "SUNDAY",
    }
}

/// Accepts full names and three letter abbreviations, ignoring case.
pub fn parse_weekday(input: &str) -> Option<Weekday> {
    let token = input.trim().to_ascii_uppercase();
    ALL_WEEKDAYS.into_iter().find(|day| {
        let name = weekday_name(*day);
        token == name || (token.len() == 3 && name.starts_with(&token))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SoundKind {
    Radio,
    File,
    External,
    Playlist,
}

impl SoundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SoundKind::Radio => "RADIO",
            SoundKind::File => "FILE",
            SoundKind::External => "EXTERNAL",
            SoundKind::Playlist => "PLAYLIST",
        }
    }
}

/// Catalog entry. Playlists carry their resolved members in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sound {
    pub name: String,
    pub kind: SoundKind,
    pub source: String,
    pub playlist: Vec<Sound>,
}

/// Storage backend for alarms. Only the schedule part of an alarm is
/// persisted; fade settings come from the configured defaults on load.
pub trait AlarmRepository: Send + Sync {
    fn load_all(&self, settings: &AlarmSettings) -> Result<Vec<Alarm>>;
    fn save_all(&self, alarms: &[Alarm]) -> Result<()>;
}

pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlarmRepository for JsonFileRepository {
    fn load_all(&self, settings: &AlarmSettings) -> Result<Vec<Alarm>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("unable to read alarm file {}", self.path.display()))?;
        parse_alarm_file_text(&content, settings)
    }

    fn save_all(&self, alarms: &[Alarm]) -> Result<()> {
        let payload = AlarmFile {
            version: 1,
            alarms: alarms.iter().map(StoredAlarm::from).collect(),
        };
        let text = serde_json::to_string_pretty(&payload)?;
        fs::write(&self.path, format!("{text}\n"))
            .with_context(|| format!("unable to write alarm file {}", self.path.display()))?;
        Ok(())
    }
}

pub fn parse_alarm_file_text(content: &str, settings: &AlarmSettings) -> Result<Vec<Alarm>> {
    let raw = serde_json::from_str::<AlarmFile>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow::anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.version != 1 {
        bail!(
            "unsupported alarm file version {}; expected version 1",
            raw.version
        );
    }

    let mut ids = HashSet::new();
    let mut alarms = Vec::with_capacity(raw.alarms.len());
    for stored in raw.alarms {
        if stored.id == 0 {
            bail!("alarm id 0 is reserved");
        }
        if !ids.insert(stored.id) {
            bail!("duplicate alarm id found: {}", stored.id);
        }
        if stored.week_days.is_empty() && !stored.one_time_only {
            bail!(
                "recurring alarm {} must include at least one week day",
                stored.id
            );
        }
        alarms.push(stored.into_alarm(settings));
    }
    Ok(alarms)
}

#[derive(Debug, Serialize, Deserialize)]
struct AlarmFile {
    version: u32,
    #[serde(default)]
    alarms: Vec<StoredAlarm>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAlarm {
    id: u32,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    one_time_only: bool,
    #[serde(default)]
    skip_once: bool,
    time: NaiveTime,
    #[serde(default)]
    week_days: WeekDays,
    #[serde(default)]
    sound_id: Option<usize>,
    #[serde(default)]
    light_ids: Vec<u32>,
}

impl StoredAlarm {
    fn into_alarm(self, settings: &AlarmSettings) -> Alarm {
        Alarm {
            id: self.id,
            enabled: self.enabled,
            one_time_only: self.one_time_only,
            skip_once: self.skip_once,
            time: self.time,
            week_days: self.week_days,
            sound_id: self.sound_id,
            light_ids: self.light_ids,
            ..Alarm::template(settings)
        }
    }
}

impl From<&Alarm> for StoredAlarm {
    fn from(alarm: &Alarm) -> Self {
        Self {
            id: alarm.id,
            enabled: alarm.enabled,
            one_time_only: alarm.one_time_only,
            skip_once: alarm.skip_once,
            time: alarm.time,
            week_days: alarm.week_days,
            sound_id: alarm.sound_id,
            light_ids: alarm.light_ids.clone(),
        }
    }
}

fn default_enabled() -> bool {
    true
}
