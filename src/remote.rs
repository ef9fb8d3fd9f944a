use std::sync::Arc;

use chrono::NaiveTime;

use crate::alarm::model::{Alarm, Sound, WeekDays};
use crate::alarm::queue::ControlCommand;
use crate::alarm::store::AlarmStore;
use crate::controller::{ControllerControls, LightStatus, OutputStatus};
use crate::error::StoreError;

/// What the line protocol and HTTP adapters may do: read and edit alarms
/// through the store, and queue immediate commands for the controller.
/// Adapters never touch outputs themselves.
#[derive(Clone)]
pub struct Remote {
    store: Arc<AlarmStore>,
    controls: ControllerControls,
}

impl Remote {
    pub fn new(store: Arc<AlarmStore>, controls: ControllerControls) -> Self {
        Self { store, controls }
    }

    pub fn store(&self) -> &AlarmStore {
        &self.store
    }

    pub fn create_alarm(
        &self,
        week_days: WeekDays,
        time: NaiveTime,
        sound_id: Option<usize>,
    ) -> Result<u32, StoreError> {
        self.store.create(week_days, time, sound_id)
    }

    pub fn get_alarm(&self, id: u32) -> Option<Alarm> {
        self.store.get(id)
    }

    pub fn remove_alarm_from_list(&self, id: u32) -> Result<Alarm, StoreError> {
        self.store.remove(id)
    }

    pub fn add_alarm_to_process(&self, id: u32) {
        self.store.add_alarm_to_process(id);
    }

    pub fn sounds(&self) -> &[Sound] {
        self.store.sounds()
    }

    pub fn set_sound_timer(&self, seconds: u32) {
        self.controls.sound_timer().set(seconds);
    }

    pub fn delete_sound_timer(&self) {
        self.controls.sound_timer().delete();
    }

    /// Remaining seconds of the sound timer, 0 when it is not running.
    pub fn get_sound_timer(&self) -> u32 {
        self.controls.sound_timer().remaining().unwrap_or(0)
    }

    /// Seconds the running sound timer was started with, 0 when idle.
    pub fn sound_timer_start(&self) -> u32 {
        self.controls.sound_timer().initial().unwrap_or(0)
    }

    pub fn all_off(&self, disable_alarms: bool) {
        self.controls
            .command(ControlCommand::AllOff { disable_alarms });
    }

    pub fn stop_active_alarm(&self) {
        self.controls.command(ControlCommand::StopActiveAlarm);
    }

    pub fn command(&self, command: ControlCommand) {
        self.controls.command(command);
    }

    pub fn get_light_control_list(&self) -> Vec<LightStatus> {
        self.controls.status().lights
    }

    pub fn output_status(&self) -> OutputStatus {
        self.controls.status()
    }
}


#[cfg(test)]
mod tests {
    use chrono::{Local, Weekday};

    use super::testing::harness;
    use super::*;

    #[test]
    fn create_then_get_round_trips_schedule_fields() {
        let harness = harness();
        let days = [Weekday::Mon, Weekday::Wed].into_iter().collect::<WeekDays>();
        let time = NaiveTime::from_hms_opt(7, 0, 0).expect("time");
        let id = harness
            .remote
            .create_alarm(days, time, Some(2))
            .expect("create");

        let alarm = harness.remote.get_alarm(id).expect("alarm");
        assert_eq!(alarm.week_days, days);
        assert_eq!(alarm.time, time);
        assert_eq!(alarm.sound_id, Some(2));
    }

    #[test]
    fn create_rejects_unknown_sound() {
        let harness = harness();
        let time = NaiveTime::from_hms_opt(7, 0, 0).expect("time");
        let err = harness
            .remote
            .create_alarm(WeekDays::all(), time, Some(3))
            .expect_err("sound 3 does not exist");
        assert!(matches!(err, StoreError::InvalidSound(3)));
        assert!(harness.remote.store().list().is_empty());
    }

    #[test]
    fn sound_timer_reads_zero_when_idle() {
        let harness = harness();
        assert_eq!(harness.remote.get_sound_timer(), 0);
        harness.remote.set_sound_timer(30);
        assert_eq!(harness.remote.get_sound_timer(), 30);
        assert_eq!(harness.remote.sound_timer_start(), 30);
        harness.remote.delete_sound_timer();
        assert_eq!(harness.remote.get_sound_timer(), 0);
    }

    #[test]
    fn light_list_reflects_controller_snapshot() {
        let mut harness = harness();
        let lights = harness.remote.get_light_control_list();
        assert_eq!(
            lights.iter().map(|light| light.id).collect::<Vec<_>>(),
            vec![1, 4]
        );
        harness.remote.command(ControlCommand::Light {
            id: 4,
            action: crate::alarm::queue::LightAction::Brightness(70),
        });
        harness.controller.tick(Local::now());
        assert_eq!(harness.remote.get_light_control_list()[1].brightness, 70.0);
    }
}
