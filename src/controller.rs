use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::alarm::fade::{brightness_at, reminders_due, volume_at};
use crate::alarm::model::Alarm;
use crate::alarm::queue::{ControlCommand, LightAction, Notification, Notifier, ProcessingQueue};
use crate::alarm::scheduler::{AlarmPhase, ScheduleKey, next_occurrence_local};
use crate::alarm::store::AlarmStore;
use crate::error::OutputError;
use crate::output::{LightOutput, SoundOutput};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightStatus {
    pub id: u32,
    pub name: String,
    pub brightness: f64,
}

/// Output state as last driven by the controller, published after every
/// tick so adapters never have to ask the hardware.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputStatus {
    pub volume: u8,
    pub lights: Vec<LightStatus>,
    pub active_alarms: Vec<u32>,
}

/// One-shot countdown that switches the sound off when it runs out.
/// Independent of alarms; the last `set` wins.
#[derive(Debug, Default)]
pub struct SoundTimer {
    state: Mutex<Option<TimerState>>,
}

#[derive(Debug, Clone, Copy)]
struct TimerState {
    initial: u32,
    remaining: u32,
}

impl SoundTimer {
    pub fn set(&self, seconds: u32) {
        *self.lock() = Some(TimerState {
            initial: seconds,
            remaining: seconds,
        });
    }

    pub fn delete(&self) {
        *self.lock() = None;
    }

    /// Remaining seconds, if a countdown is running.
    pub fn remaining(&self) -> Option<u32> {
        self.lock().map(|state| state.remaining)
    }

    /// Seconds the running countdown was started with.
    pub fn initial(&self) -> Option<u32> {
        self.lock().map(|state| state.initial)
    }

    /// Counts one second down. Returns true when the countdown expires.
    fn tick(&self) -> bool {
        let mut guard = self.lock();
        let Some(state) = guard.as_mut() else {
            return false;
        };
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            *guard = None;
            return true;
        }
        false
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<TimerState>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable access to a running controller for the remote adapters.
#[derive(Debug, Clone)]
pub struct ControllerControls {
    notifier: Notifier,
    sound_timer: Arc<SoundTimer>,
    status: Arc<Mutex<OutputStatus>>,
}

impl ControllerControls {
    pub fn command(&self, command: ControlCommand) {
        self.notifier.command(command);
    }

    pub fn sound_timer(&self) -> &SoundTimer {
        &self.sound_timer
    }

    pub fn status(&self) -> OutputStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone)]
struct AlarmRuntime {
    key: ScheduleKey,
    phase: AlarmPhase,
    next_occurrence: Option<DateTime<Local>>,
    activated_at: Option<DateTime<Local>>,
    reminders_played: u32,
    last_volume: Option<u8>,
}

impl AlarmRuntime {
    fn scheduled(alarm: &Alarm, now: &DateTime<Local>) -> Self {
        Self {
            key: ScheduleKey::from(alarm),
            phase: AlarmPhase::Scheduled,
            next_occurrence: schedule(alarm, now),
            activated_at: None,
            reminders_played: 0,
            last_volume: None,
        }
    }
}

fn schedule(alarm: &Alarm, now: &DateTime<Local>) -> Option<DateTime<Local>> {
    if alarm.enabled {
        next_occurrence_local(alarm, now)
    } else {
        None
    }
}

struct LightChannel {
    output: Box<dyn LightOutput>,
    brightness: f64,
    ramp: Option<LightRamp>,
}

#[derive(Debug, Clone, Copy)]
struct LightRamp {
    from: f64,
    target: f64,
    seconds: u32,
    started: DateTime<Local>,
}

impl LightRamp {
    fn value_at(&self, now: &DateTime<Local>) -> f64 {
        if self.seconds == 0 {
            return self.target;
        }
        let elapsed = elapsed_seconds(&self.started, now);
        let ratio = (f64::from(elapsed) / f64::from(self.seconds)).min(1.0);
        self.from + (self.target - self.from) * ratio
    }
}

/// Drives every alarm through SCHEDULED, ACTIVE and STOPPED and owns the
/// sound and light outputs. Runs on its own thread, one tick per poll
/// interval; [`Controller::tick`] is the whole per-tick behaviour.
pub struct Controller {
    store: Arc<AlarmStore>,
    queue: ProcessingQueue,
    controls: ControllerControls,
    sound: Box<dyn SoundOutput>,
    lights: Vec<LightChannel>,
    runtimes: HashMap<u32, AlarmRuntime>,
    volume: u8,
}

impl Controller {
    pub fn new(
        store: Arc<AlarmStore>,
        queue: ProcessingQueue,
        notifier: Notifier,
        sound: Box<dyn SoundOutput>,
        lights: Vec<Box<dyn LightOutput>>,
        volume: u8,
    ) -> Self {
        let lights = lights
            .into_iter()
            .map(|output| LightChannel {
                output,
                brightness: 0.0,
                ramp: None,
            })
            .collect::<Vec<_>>();
        let controls = ControllerControls {
            notifier,
            sound_timer: Arc::new(SoundTimer::default()),
            status: Arc::new(Mutex::new(OutputStatus::default())),
        };
        let controller = Self {
            store,
            queue,
            controls,
            sound,
            lights,
            runtimes: HashMap::new(),
            volume,
        };
        controller.publish_status();
        controller
    }

    pub fn controls(&self) -> ControllerControls {
        self.controls.clone()
    }

    pub fn phase(&self, alarm_id: u32) -> Option<AlarmPhase> {
        self.runtimes.get(&alarm_id).map(|runtime| runtime.phase)
    }

    pub fn spawn(self, interval: Duration) -> Result<ControllerHandle> {
        let controls = self.controls();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("controller".to_string())
            .spawn(move || self.run(&stop_for_thread, interval))
            .context("unable to start controller thread")?;
        Ok(ControllerHandle {
            controls,
            stop,
            join: Some(join),
        })
    }

    fn run(mut self, stop: &AtomicBool, interval: Duration) {
        info!("controller started, polling every {interval:?}");
        let volume = self.volume;
        report(self.sound.set_volume(volume), "set initial volume");
        while !stop.load(Ordering::Relaxed) {
            self.tick(Local::now());
            thread::sleep(interval);
        }
        let dropped = self.queue.drain().len();
        if dropped > 0 {
            debug!("dropping {dropped} pending notifications on shutdown");
        }
        self.all_off(false);
        info!("controller stopped");
    }

    pub fn tick(&mut self, now: DateTime<Local>) {
        for notification in self.queue.drain() {
            match notification {
                Notification::Alarm(id) => self.refresh_alarm(id, &now),
                Notification::Command(command) => self.execute(command, &now),
            }
        }

        let alarms = self.store.list();
        for alarm in &alarms {
            self.detect_due(alarm, &now);
        }
        for alarm in &alarms {
            if self.phase(alarm.id) == Some(AlarmPhase::Active) {
                self.advance_active(alarm, &now);
            }
        }

        self.advance_light_ramps(&now);
        if self.controls.sound_timer.tick() {
            info!("sound timer expired");
            report(self.sound.off(), "switch sound off");
        }
        self.publish_status();
    }

    /// Re-evaluates one alarm after a notification. Only the alarm's current
    /// fields and `now` matter, so duplicates change nothing.
    fn refresh_alarm(&mut self, id: u32, now: &DateTime<Local>) {
        let Some(alarm) = self.store.get(id) else {
            if let Some(runtime) = self.runtimes.remove(&id)
                && runtime.phase == AlarmPhase::Active
            {
                info!("alarm {id} removed while active, stopping it");
                report(self.sound.off(), "switch sound off");
            }
            return;
        };

        if !self.runtimes.contains_key(&id) {
            debug!("scheduling alarm {id}");
            self.runtimes
                .insert(id, AlarmRuntime::scheduled(&alarm, now));
            return;
        }
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return;
        };
        let key = ScheduleKey::from(&alarm);
        if runtime.key == key {
            return;
        }

        if runtime.phase == AlarmPhase::Active {
            runtime.key = key;
            runtime.next_occurrence = schedule(&alarm, now);
            if !alarm.enabled {
                info!("alarm {id} disabled while active, stopping it");
                runtime.phase = AlarmPhase::Stopped;
                runtime.activated_at = None;
                report(self.sound.off(), "switch sound off");
            }
            return;
        }
        *runtime = AlarmRuntime::scheduled(&alarm, now);
        debug!(
            "alarm {id} is {}, next occurrence {:?}",
            runtime.phase.as_str(),
            runtime.next_occurrence
        );
    }

    fn detect_due(&mut self, alarm: &Alarm, now: &DateTime<Local>) {
        let runtime = self
            .runtimes
            .entry(alarm.id)
            .or_insert_with(|| AlarmRuntime::scheduled(alarm, now));

        // The next occurrence was computed when the stopped one fired, so
        // reaching it re-arms the alarm whatever day the stop happened on.
        if runtime.phase == AlarmPhase::Stopped
            && runtime.next_occurrence.is_some_and(|next| *now >= next)
        {
            runtime.phase = AlarmPhase::Scheduled;
        }

        if !alarm.enabled || runtime.phase != AlarmPhase::Scheduled {
            return;
        }
        let Some(occurrence) = runtime.next_occurrence else {
            return;
        };
        if *now < occurrence {
            return;
        }

        runtime.next_occurrence = next_occurrence_local(alarm, now);
        if alarm.skip_once {
            info!("alarm {} skipped once at {occurrence}", alarm.id);
            self.clear_skip_once(alarm.id);
            return;
        }
        self.activate(alarm, now);
    }

    fn clear_skip_once(&self, id: u32) {
        let mut tx = self.store.begin_transaction();
        if !tx.alarm(id).is_some_and(|alarm| alarm.skip_once) {
            return;
        }
        match tx.alarm_mut(id) {
            Ok(alarm) => alarm.skip_once = false,
            Err(err) => {
                warn!("unable to clear skip-once flag: {err}");
                return;
            }
        }
        if let Err(err) = tx.commit() {
            warn!("unable to clear skip-once flag of alarm {id}: {err}");
        }
    }

    fn activate(&mut self, alarm: &Alarm, now: &DateTime<Local>) {
        info!("alarm {} activated", alarm.id);
        if let Some(runtime) = self.runtimes.get_mut(&alarm.id) {
            runtime.phase = AlarmPhase::Active;
            runtime.activated_at = Some(*now);
            runtime.reminders_played = 0;
            runtime.last_volume = Some(volume_at(alarm, 0));
        }

        report(self.sound.set_volume(volume_at(alarm, 0)), "set alarm volume");
        self.volume = volume_at(alarm, 0);
        report(self.sound.on(), "switch sound on");
        if !alarm.greeting.is_empty() {
            report(self.sound.announce(&alarm.greeting), "announce greeting");
        }
        self.play_alarm_sound(alarm);
    }

    fn play_alarm_sound(&mut self, alarm: &Alarm) {
        let Some(sound_id) = alarm.sound_id else {
            debug!("alarm {} has no sound", alarm.id);
            return;
        };
        match self.store.sound(sound_id) {
            Some(sound) => report(self.sound.play(sound), "play alarm sound"),
            None => warn!("alarm {} refers to unknown sound {sound_id}", alarm.id),
        }
    }

    fn advance_active(&mut self, alarm: &Alarm, now: &DateTime<Local>) {
        let Some(runtime) = self.runtimes.get(&alarm.id) else {
            return;
        };
        let Some(activated_at) = runtime.activated_at else {
            return;
        };
        let elapsed = elapsed_seconds(&activated_at, now);

        if elapsed >= alarm.duration {
            info!("alarm {} finished after {elapsed}s", alarm.id);
            self.stop_alarm(alarm.id);
            return;
        }

        let brightness = brightness_at(alarm, elapsed);
        for light in self
            .lights
            .iter_mut()
            .filter(|light| alarm.applies_to_light(light.output.id()))
        {
            light.ramp = None;
            if light.brightness != brightness {
                light.brightness = brightness;
                report(light.output.set_brightness(brightness), "dim light");
            }
        }

        let volume = volume_at(alarm, elapsed);
        let due = reminders_due(alarm, elapsed);
        let (last_volume, played) = (runtime.last_volume, runtime.reminders_played);
        if due > played {
            debug!("alarm {} reminder {due}", alarm.id);
            report(
                self.sound.set_volume(alarm.volume_fade_in_end),
                "set reminder volume",
            );
            self.volume = alarm.volume_fade_in_end;
            self.play_alarm_sound(alarm);
        } else if last_volume != Some(volume) {
            report(self.sound.set_volume(volume), "set alarm volume");
            self.volume = volume;
        }

        if let Some(runtime) = self.runtimes.get_mut(&alarm.id) {
            runtime.reminders_played = due.max(played);
            runtime.last_volume = Some(self.volume);
        }
    }

    /// Ends the occurrence: sound off, lights untouched. One-time alarms
    /// leave the store.
    fn stop_alarm(&mut self, id: u32) {
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return;
        };
        if runtime.phase != AlarmPhase::Active {
            return;
        }
        runtime.phase = AlarmPhase::Stopped;
        runtime.activated_at = None;
        report(self.sound.off(), "switch sound off");

        if self.store.get(id).is_some_and(|alarm| alarm.one_time_only) {
            match self.store.remove(id) {
                Ok(_) => info!("one-time alarm {id} completed and removed"),
                Err(err) => error!("unable to remove one-time alarm {id}: {err}"),
            }
        }
    }

    fn stop_active_alarms(&mut self) {
        let active = self
            .runtimes
            .iter()
            .filter(|(_, runtime)| runtime.phase == AlarmPhase::Active)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in active {
            info!("stopping active alarm {id}");
            self.stop_alarm(id);
        }
    }

    fn all_off(&mut self, disable_alarms: bool) {
        info!("switching everything off (disable alarms: {disable_alarms})");
        self.stop_active_alarms();
        report(self.sound.off(), "switch sound off");
        for light in &mut self.lights {
            light.ramp = None;
            light.brightness = 0.0;
            report(light.output.off(), "switch light off");
        }
        if disable_alarms && let Err(err) = self.store.disable_all() {
            error!("unable to disable alarms: {err}");
        }
        self.publish_status();
    }

    fn execute(&mut self, command: ControlCommand, now: &DateTime<Local>) {
        debug!("executing {command:?}");
        match command {
            ControlCommand::StopActiveAlarm => self.stop_active_alarms(),
            ControlCommand::AllOff { disable_alarms } => self.all_off(disable_alarms),
            ControlCommand::SoundOn => report(self.sound.on(), "switch sound on"),
            ControlCommand::SoundOff => report(self.sound.off(), "switch sound off"),
            ControlCommand::PlaySound(sound_id) => match self.store.sound(sound_id) {
                Some(sound) => {
                    report(self.sound.on(), "switch sound on");
                    report(self.sound.play(sound), "play sound");
                }
                None => warn!("ignoring request to play unknown sound {sound_id}"),
            },
            ControlCommand::SetVolume(volume) => {
                self.volume = volume;
                report(self.sound.set_volume(volume), "set volume");
            }
            ControlCommand::Light { id, action } => self.light_action(id, action, now),
        }
    }

    fn light_action(&mut self, id: u32, action: LightAction, now: &DateTime<Local>) {
        let Some(light) = self.lights.iter_mut().find(|light| light.output.id() == id) else {
            warn!("ignoring command for unknown light {id}");
            return;
        };
        match action {
            LightAction::Brightness(percent) => {
                light.ramp = None;
                light.brightness = f64::from(percent);
                report(light.output.set_brightness(light.brightness), "set light");
            }
            LightAction::Off => {
                light.ramp = None;
                light.brightness = 0.0;
                report(light.output.off(), "switch light off");
            }
            LightAction::DimUp { target, seconds } => {
                light.ramp = Some(LightRamp {
                    from: light.brightness,
                    target: f64::from(target),
                    seconds,
                    started: *now,
                });
            }
        }
    }

    fn advance_light_ramps(&mut self, now: &DateTime<Local>) {
        for light in &mut self.lights {
            let Some(ramp) = light.ramp else {
                continue;
            };
            let value = ramp.value_at(now);
            if value != light.brightness {
                light.brightness = value;
                report(light.output.set_brightness(value), "dim light");
            }
            if value == ramp.target {
                light.ramp = None;
            }
        }
    }

    fn publish_status(&self) {
        let mut active_alarms = self
            .runtimes
            .iter()
            .filter(|(_, runtime)| runtime.phase == AlarmPhase::Active)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        active_alarms.sort_unstable();
        let status = OutputStatus {
            volume: self.volume,
            lights: self
                .lights
                .iter()
                .map(|light| LightStatus {
                    id: light.output.id(),
                    name: light.output.name().to_string(),
                    brightness: light.brightness,
                })
                .collect(),
            active_alarms,
        };
        *self
            .controls
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = status;
    }
}

/// Owner of the controller thread. Dropping it stops the thread, which
/// switches everything off before exiting.
pub struct ControllerHandle {
    controls: ControllerControls,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn controls(&self) -> ControllerControls {
        self.controls.clone()
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            error!("controller thread panicked");
        }
    }
}

fn report(result: Result<(), OutputError>, action: &str) {
    if let Err(err) = result {
        warn!("unable to {action}: {err}");
    }
}

fn elapsed_seconds(since: &DateTime<Local>, now: &DateTime<Local>) -> u32 {
    let seconds = (*now - *since).num_seconds().max(0);
    u32::try_from(seconds).unwrap_or(u32::MAX)
}
