use std::fmt;

use serde::Deserialize;
use tracing::{debug, info};

use crate::alarm::model::Sound;
use crate::error::OutputError;

/// Sound backend. Only the controller thread calls it.
pub trait SoundOutput: Send {
    fn on(&mut self) -> Result<(), OutputError>;
    fn off(&mut self) -> Result<(), OutputError>;
    fn play(&mut self, sound: &Sound) -> Result<(), OutputError>;
    fn set_volume(&mut self, volume: u8) -> Result<(), OutputError>;
    fn announce(&mut self, text: &str) -> Result<(), OutputError>;
}

/// One dimmable light. Only the controller thread calls it.
pub trait LightOutput: Send {
    fn id(&self) -> u32;
    fn name(&self) -> &str;
    fn set_brightness(&mut self, percent: f64) -> Result<(), OutputError>;
    fn off(&mut self) -> Result<(), OutputError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightKind {
    None,
    Gpio18,
    Pca9685,
    Nrf24lo1,
    Mqtt,
}

impl fmt::Display for LightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LightKind::None => "none",
            LightKind::Gpio18 => "gpio18",
            LightKind::Pca9685 => "pca9685",
            LightKind::Nrf24lo1 => "nrf24lo1",
            LightKind::Mqtt => "mqtt",
        };
        f.write_str(text)
    }
}

/// Sound output used when no playback engine is attached: every request is
/// written to the log.
#[derive(Debug, Default)]
pub struct LoggedSound {
    playing: Option<String>,
}

impl SoundOutput for LoggedSound {
    fn on(&mut self) -> Result<(), OutputError> {
        debug!("sound output on");
        Ok(())
    }

    fn off(&mut self) -> Result<(), OutputError> {
        if let Some(name) = self.playing.take() {
            info!("sound '{name}' stopped");
        }
        Ok(())
    }

    fn play(&mut self, sound: &Sound) -> Result<(), OutputError> {
        if sound.source.is_empty() && sound.playlist.is_empty() {
            return Err(OutputError::Sound(format!("sound '{}' has no source", sound.name)));
        }
        if sound.playlist.is_empty() {
            info!("playing {} '{}' from {}", sound.kind.as_str(), sound.name, sound.source);
        } else {
            let names = sound
                .playlist
                .iter()
                .map(|entry| entry.name.as_str())
                .collect::<Vec<_>>();
            info!("playing playlist '{}': {}", sound.name, names.join(", "));
        }
        self.playing = Some(sound.name.clone());
        Ok(())
    }

    fn set_volume(&mut self, volume: u8) -> Result<(), OutputError> {
        debug!("sound volume {volume}%");
        Ok(())
    }

    fn announce(&mut self, text: &str) -> Result<(), OutputError> {
        info!("announcement: {text}");
        Ok(())
    }
}

/// Light output used when the physical driver runs outside this process.
#[derive(Debug)]
pub struct LoggedLight {
    id: u32,
    name: String,
    kind: LightKind,
}

impl LoggedLight {
    pub fn new(id: u32, name: impl Into<String>, kind: LightKind) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
        }
    }
}

impl LightOutput for LoggedLight {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn set_brightness(&mut self, percent: f64) -> Result<(), OutputError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(OutputError::Light {
                id: self.id,
                reason: format!("brightness {percent} out of range"),
            });
        }
        if self.kind != LightKind::None {
            debug!("light {} ({}) brightness {percent:.1}%", self.id, self.kind);
        }
        Ok(())
    }

    fn off(&mut self) -> Result<(), OutputError> {
        if self.kind != LightKind::None {
            debug!("light {} ({}) off", self.id, self.kind);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::model::SoundKind;

    #[test]
    fn logged_outputs_accept_all_requests() {
        let mut sound = LoggedSound::default();
        let track = Sound {
            name: "birds".to_string(),
            kind: SoundKind::File,
            source: "birds.mp3".to_string(),
            playlist: Vec::new(),
        };
        sound.on().expect("on");
        sound.play(&track).expect("play");
        assert_eq!(sound.playing.as_deref(), Some("birds"));
        sound.off().expect("off");
        assert!(sound.playing.is_none());

        let mut light = LoggedLight::new(2, "bedroom", LightKind::Pca9685);
        assert_eq!(light.id(), 2);
        assert_eq!(light.name(), "bedroom");
        light.set_brightness(40.0).expect("brightness");
        light.off().expect("off");
    }

    #[test]
    fn logged_outputs_reject_unusable_requests() {
        let mut sound = LoggedSound::default();
        let silent = Sound {
            name: "nothing".to_string(),
            kind: SoundKind::External,
            source: String::new(),
            playlist: Vec::new(),
        };
        assert!(matches!(sound.play(&silent), Err(OutputError::Sound(_))));
        assert!(sound.playing.is_none());

        let mut light = LoggedLight::new(5, "desk", LightKind::Gpio18);
        assert_eq!(
            light.set_brightness(120.0),
            Err(OutputError::Light {
                id: 5,
                reason: "brightness 120 out of range".to_string()
            })
        );
    }

    #[test]
    fn light_kind_parses_lowercase_names() {
        let kind: LightKind = serde_json::from_str("\"nrf24lo1\"").expect("kind");
        assert_eq!(kind, LightKind::Nrf24lo1);
        assert_eq!(kind.to_string(), "nrf24lo1");
    }
}
