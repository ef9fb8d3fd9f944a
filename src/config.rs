use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde::de::IntoDeserializer;
use serde::de::value::{Error as ValueError, StrDeserializer};
use tracing::warn;

use crate::alarm::model::{AlarmSettings, Sound, SoundKind};
use crate::output::LightKind;

/// Daemon configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub name: String,
    pub volume_default: u8,
    pub network: NetworkConfig,
    pub alarm: AlarmSettings,
    pub sounds: Vec<Sound>,
    pub lights: Vec<LightConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Line protocol port, 0 disables the listener.
    pub command_port: u16,
    /// HTTP port, 0 disables the listener.
    pub http_port: u16,
    pub bind: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            command_port: 4000,
            http_port: 8099,
            bind: "0.0.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LightConfig {
    pub id: u32,
    pub name: String,
    pub kind: LightKind,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    name: String,
    volume_default: u8,
    network: NetworkConfig,
    alarm: AlarmSettings,
    sounds: Vec<RawSound>,
    lights: Vec<RawLight>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            name: "wakeclock".to_string(),
            volume_default: 50,
            network: NetworkConfig::default(),
            alarm: AlarmSettings::default(),
            sounds: Vec::new(),
            lights: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawSound {
    name: String,
    #[serde(rename = "type")]
    kind: SoundKind,
    #[serde(default)]
    source: String,
}

#[derive(Debug, Deserialize)]
struct RawLight {
    id: u32,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read configuration {}", path.display()))?;
    parse_config_text(&content)
}

pub fn parse_config_text(content: &str) -> Result<DaemonConfig> {
    let raw = serde_json::from_str::<RawConfig>(content).map_err(|err| {
        let line = err.line();
        let column = err.column();
        anyhow!("invalid JSON at line {line}, column {column}: {err}")
    })?;

    if raw.name.trim().is_empty() {
        bail!("name must not be empty");
    }
    check_percent("volume_default", raw.volume_default)?;
    validate_alarm_settings(&raw.alarm)?;

    Ok(DaemonConfig {
        name: raw.name,
        volume_default: raw.volume_default,
        network: raw.network,
        alarm: raw.alarm,
        sounds: resolve_sounds(raw.sounds)?,
        lights: resolve_lights(raw.lights)?,
    })
}

fn check_percent(field: &str, value: u8) -> Result<()> {
    if value > 100 {
        bail!("{field} must be between 0 and 100, got {value}");
    }
    Ok(())
}

fn validate_alarm_settings(settings: &AlarmSettings) -> Result<()> {
    check_percent("alarm.volume_fade_in_start", settings.volume_fade_in_start)?;
    check_percent("alarm.volume_fade_in_end", settings.volume_fade_in_end)?;
    check_percent("alarm.volume_alarm_end", settings.volume_alarm_end)?;
    check_percent(
        "alarm.light_dim_up_brightness",
        settings.light_dim_up_brightness,
    )?;
    if settings.fade_in > settings.duration {
        warn!(
            "alarm fade-in ({}s) is longer than the alarm duration ({}s)",
            settings.fade_in, settings.duration
        );
    }
    Ok(())
}

/// Builds the catalog in file order. Playlists list member names separated
/// by commas; members must be plain sounds.
fn resolve_sounds(raw: Vec<RawSound>) -> Result<Vec<Sound>> {
    let mut plain = HashMap::new();
    for sound in &raw {
        if sound.name.trim().is_empty() {
            bail!("sound names must not be empty");
        }
        if sound.kind != SoundKind::Playlist {
            plain.insert(sound.name.clone(), sound);
        }
    }

    let mut names = HashSet::new();
    let mut sounds = Vec::with_capacity(raw.len());
    for sound in &raw {
        if !names.insert(sound.name.as_str()) {
            bail!("duplicate sound name found: {}", sound.name);
        }
        let playlist = if sound.kind == SoundKind::Playlist {
            let members = sound
                .source
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(|name| {
                    plain
                        .get(name)
                        .map(|member| Sound {
                            name: member.name.clone(),
                            kind: member.kind,
                            source: member.source.clone(),
                            playlist: Vec::new(),
                        })
                        .ok_or_else(|| {
                            anyhow!("playlist '{}' refers to unknown sound '{name}'", sound.name)
                        })
                })
                .collect::<Result<Vec<_>>>()?;
            if members.is_empty() {
                bail!("playlist '{}' has no entries", sound.name);
            }
            members
        } else {
            Vec::new()
        };
        sounds.push(Sound {
            name: sound.name.clone(),
            kind: sound.kind,
            source: sound.source.clone(),
            playlist,
        });
    }
    Ok(sounds)
}

fn resolve_lights(raw: Vec<RawLight>) -> Result<Vec<LightConfig>> {
    let mut ids = HashSet::new();
    let mut lights = Vec::with_capacity(raw.len());
    for light in raw {
        if !ids.insert(light.id) {
            bail!("duplicate light id found: {}", light.id);
        }
        let kind = match light.kind.as_deref() {
            None => LightKind::None,
            Some(name) => parse_light_kind(name).unwrap_or_else(|| {
                warn!("light {} has unknown type '{name}', using none", light.id);
                LightKind::None
            }),
        };
        let name = if light.name.is_empty() {
            format!("light {}", light.id)
        } else {
            light.name
        };
        lights.push(LightConfig {
            id: light.id,
            name,
            kind,
        });
    }
    Ok(lights)
}

fn parse_light_kind(name: &str) -> Option<LightKind> {
    let lowered = name.trim().to_ascii_lowercase();
    let deserializer: StrDeserializer<'_, ValueError> = lowered.as_str().into_deserializer();
    LightKind::deserialize(deserializer).ok()
}

impl DaemonConfig {
    /// Human-readable summary, printed by `--check` and logged at startup.
    pub fn dump(&self) -> String {
        let alarm = &self.alarm;
        let mut text = String::new();
        let _ = writeln!(text, "name: {}", self.name);
        let _ = writeln!(text, "default volume: {}%", self.volume_default);
        let _ = writeln!(
            text,
            "command port: {}, http port: {}, bind: {}",
            self.network.command_port, self.network.http_port, self.network.bind
        );
        let _ = writeln!(
            text,
            "alarm defaults: fade-in {}s, duration {}s, reminder every {}s, volume {}% -> {}% -> {}%, light {}% over {}s",
            alarm.fade_in,
            alarm.duration,
            alarm.reminder_interval,
            alarm.volume_fade_in_start,
            alarm.volume_fade_in_end,
            alarm.volume_alarm_end,
            alarm.light_dim_up_brightness,
            alarm.light_dim_up_duration
        );
        if !alarm.greeting.is_empty() {
            let _ = writeln!(text, "greeting: {}", alarm.greeting);
        }

        let _ = writeln!(text, "sounds: {}", self.sounds.len());
        for (index, sound) in self.sounds.iter().enumerate() {
            if sound.playlist.is_empty() {
                let _ = writeln!(
                    text,
                    "  {index}: {} {} {}",
                    sound.name,
                    sound.kind.as_str(),
                    sound.source
                );
            } else {
                let members = sound
                    .playlist
                    .iter()
                    .map(|member| member.name.as_str())
                    .collect::<Vec<_>>();
                let _ = writeln!(
                    text,
                    "  {index}: {} {} [{}]",
                    sound.name,
                    sound.kind.as_str(),
                    members.join(", ")
                );
            }
        }

        let _ = writeln!(text, "lights: {}", self.lights.len());
        for light in &self.lights {
            let _ = writeln!(text, "  {}: {} ({})", light.id, light.name, light.kind);
        }
        text
    }
}
