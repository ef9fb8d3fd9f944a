use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use chrono::NaiveTime;
use tracing::{debug, info, warn};

use crate::alarm::model::{Alarm, AlarmRepository, AlarmSettings, Sound, WeekDays};
use crate::alarm::queue::Notifier;
use crate::error::StoreError;

/// Registry of all alarms, the template for new ones and the sound catalog.
///
/// Every mutation goes through a [`Transaction`], which holds the list lock
/// until it is committed or dropped. Committing persists the whole list and
/// notifies the controller about each touched alarm.
pub struct AlarmStore {
    alarms: Mutex<Vec<Alarm>>,
    transaction_owner: Mutex<Option<ThreadId>>,
    template: Alarm,
    sounds: Vec<Sound>,
    repository: Box<dyn AlarmRepository>,
    notifier: Notifier,
}

impl AlarmStore {
    /// Loads persisted alarms. A load failure is logged and the store starts
    /// empty.
    pub fn open(
        settings: &AlarmSettings,
        sounds: Vec<Sound>,
        repository: Box<dyn AlarmRepository>,
        notifier: Notifier,
    ) -> Self {
        let alarms = match repository.load_all(settings) {
            Ok(alarms) => {
                info!("loaded {} stored alarms", alarms.len());
                alarms
            }
            Err(err) => {
                warn!("unable to load stored alarms, starting with none: {err:#}");
                Vec::new()
            }
        };
        for alarm in &alarms {
            notifier.alarm_changed(alarm.id);
        }

        Self {
            alarms: Mutex::new(alarms),
            transaction_owner: Mutex::new(None),
            template: Alarm::template(settings),
            sounds,
            repository,
            notifier,
        }
    }

    /// Creates an alarm from the template. Without week days the alarm is a
    /// one-time alarm.
    pub fn create(
        &self,
        week_days: WeekDays,
        time: NaiveTime,
        sound_id: Option<usize>,
    ) -> Result<u32, StoreError> {
        let mut tx = self.begin_transaction();
        let id = tx.next_id();
        tx.insert(Alarm {
            id,
            time,
            week_days,
            one_time_only: week_days.is_empty(),
            sound_id,
            ..self.template.clone()
        });
        tx.commit()?;
        info!("created alarm with id {id}");
        Ok(id)
    }

    pub fn get(&self, id: u32) -> Option<Alarm> {
        self.lock_alarms()
            .iter()
            .find(|alarm| alarm.id == id)
            .cloned()
    }

    /// Copy of all alarms in insertion order.
    pub fn list(&self) -> Vec<Alarm> {
        self.lock_alarms().clone()
    }

    pub fn remove(&self, id: u32) -> Result<Alarm, StoreError> {
        let mut tx = self.begin_transaction();
        let removed = tx.remove(id)?;
        tx.commit()?;
        info!("removed alarm with id {id}");
        Ok(removed)
    }

    pub fn disable_all(&self) -> Result<(), StoreError> {
        let mut tx = self.begin_transaction();
        let ids = tx.alarms().iter().map(|alarm| alarm.id).collect::<Vec<_>>();
        for id in ids {
            tx.alarm_mut(id)?.enabled = false;
        }
        tx.commit()
    }

    /// Notifies the controller about an alarm without changing it.
    pub fn add_alarm_to_process(&self, id: u32) {
        self.notifier.alarm_changed(id);
    }

    /// Opens the single transaction. Blocks while another thread holds one.
    ///
    /// # Panics
    ///
    /// Opening a second transaction on the thread that already holds one
    /// would deadlock on the list lock, so it aborts instead.
    pub fn begin_transaction(&self) -> Transaction<'_> {
        let current = thread::current().id();
        if *self.lock_owner() == Some(current) {
            panic!("alarm store transaction opened while another one is open on this thread");
        }
        let guard = self.lock_alarms();
        *self.lock_owner() = Some(current);
        let working = guard.clone();
        Transaction {
            store: self,
            guard,
            working,
            touched: Vec::new(),
        }
    }

    pub fn template(&self) -> &Alarm {
        &self.template
    }

    pub fn sounds(&self) -> &[Sound] {
        &self.sounds
    }

    pub fn sound(&self, id: usize) -> Option<&Sound> {
        self.sounds.get(id)
    }

    fn lock_alarms(&self) -> MutexGuard<'_, Vec<Alarm>> {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.transaction_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn validate(&self, alarm: &Alarm) -> Result<(), StoreError> {
        if let Some(sound_id) = alarm.sound_id
            && sound_id >= self.sounds.len()
        {
            return Err(StoreError::InvalidSound(sound_id));
        }
        if alarm.week_days.is_empty() && !alarm.one_time_only {
            return Err(StoreError::EmptyWeekDays(alarm.id));
        }
        let percentages = [
            ("volumeFadeInStart", alarm.volume_fade_in_start),
            ("volumeFadeInEnd", alarm.volume_fade_in_end),
            ("volumeAlarmEnd", alarm.volume_alarm_end),
            ("lightDimUpBrightness", alarm.light_dim_up_brightness),
        ];
        for (field, value) in percentages {
            if value > 100 {
                return Err(StoreError::OutOfRange {
                    field,
                    value: u32::from(value),
                });
            }
        }
        Ok(())
    }
}

/// Open edit of the alarm list. Changes are made on a working copy and only
/// become visible on [`Transaction::commit`]; dropping the transaction
/// discards them.
pub struct Transaction<'a> {
    store: &'a AlarmStore,
    guard: MutexGuard<'a, Vec<Alarm>>,
    working: Vec<Alarm>,
    touched: Vec<u32>,
}

impl Transaction<'_> {
    pub fn alarms(&self) -> &[Alarm] {
        &self.working
    }

    pub fn alarm(&self, id: u32) -> Option<&Alarm> {
        self.working.iter().find(|alarm| alarm.id == id)
    }

    pub fn alarm_mut(&mut self, id: u32) -> Result<&mut Alarm, StoreError> {
        self.touch(id);
        self.working
            .iter_mut()
            .find(|alarm| alarm.id == id)
            .ok_or(StoreError::UnknownAlarm(id))
    }

    pub fn insert(&mut self, alarm: Alarm) {
        self.touch(alarm.id);
        self.working.push(alarm);
    }

    pub fn remove(&mut self, id: u32) -> Result<Alarm, StoreError> {
        let index = self
            .working
            .iter()
            .position(|alarm| alarm.id == id)
            .ok_or(StoreError::UnknownAlarm(id))?;
        self.touch(id);
        Ok(self.working.remove(index))
    }

    /// Largest id in use plus one, or 1 for an empty list.
    pub fn next_id(&self) -> u32 {
        self.working
            .iter()
            .map(|alarm| alarm.id)
            .max()
            .map_or(1, |max| max + 1)
    }

    /// Publishes the working copy, persists it and notifies the controller.
    /// Fails without any change if a touched alarm is invalid. A failed save
    /// is only logged; memory stays authoritative.
    pub fn commit(mut self) -> Result<(), StoreError> {
        for id in &self.touched {
            if let Some(alarm) = self.working.iter().find(|alarm| alarm.id == *id) {
                self.store.validate(alarm)?;
            }
        }

        *self.guard = std::mem::take(&mut self.working);
        if let Err(err) = self.store.repository.save_all(&self.guard) {
            warn!(
                "{}",
                StoreError::Persistence(err.context("unable to save alarms"))
            );
        }
        debug!("committed transaction touching alarms {:?}", self.touched);
        for id in &self.touched {
            self.store.notifier.alarm_changed(*id);
        }
        Ok(())
    }

    fn touch(&mut self, id: u32) {
        if !self.touched.contains(&id) {
            self.touched.push(id);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        *self.store.lock_owner() = None;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use anyhow::{Result, bail};

    use crate::alarm::model::{Alarm, AlarmRepository, AlarmSettings};

    /// In-memory repository that can be told to fail.
    #[derive(Clone, Default)]
    pub struct MemoryRepository {
        pub stored: Arc<Mutex<Vec<Alarm>>>,
        pub fail_load: bool,
        pub fail_save: bool,
    }

    impl AlarmRepository for MemoryRepository {
        fn load_all(&self, _settings: &AlarmSettings) -> Result<Vec<Alarm>> {
            if self.fail_load {
                bail!("storage offline");
            }
            Ok(self.stored.lock().expect("repository lock").clone())
        }

        fn save_all(&self, alarms: &[Alarm]) -> Result<()> {
            if self.fail_save {
                bail!("storage offline");
            }
            *self.stored.lock().expect("repository lock") = alarms.to_vec();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;

    use chrono::Weekday;

    use super::testing::MemoryRepository;
    use super::*;
    use crate::alarm::model::SoundKind;
    use crate::alarm::queue::{Notification, ProcessingQueue, processing_queue};

    fn sounds() -> Vec<Sound> {
        (0..3)
            .map(|index| Sound {
                name: format!("sound{index}"),
                kind: SoundKind::File,
                source: format!("sound{index}.mp3"),
                playlist: Vec::new(),
            })
            .collect()
    }

    fn store_with(repository: MemoryRepository) -> (AlarmStore, ProcessingQueue) {
        let (notifier, queue) = processing_queue();
        let store = AlarmStore::open(
            &AlarmSettings::default(),
            sounds(),
            Box::new(repository),
            notifier,
        );
        (store, queue)
    }

    fn seven() -> NaiveTime {
        NaiveTime::from_hms_opt(7, 0, 0).expect("time")
    }

    #[test]
    fn create_then_get_round_trips_schedule() {
        let (store, queue) = store_with(MemoryRepository::default());
        let days: WeekDays = [Weekday::Mon, Weekday::Wed].into_iter().collect();
        let id = store.create(days, seven(), Some(2)).expect("create");

        let alarm = store.get(id).expect("alarm exists");
        assert_eq!(alarm.week_days, days);
        assert_eq!(alarm.time, seven());
        assert_eq!(alarm.sound_id, Some(2));
        assert!(!alarm.one_time_only);
        assert_eq!(alarm.duration, 1800);
        assert_eq!(queue.drain(), vec![Notification::Alarm(id)]);
    }

    #[test]
    fn ids_continue_after_highest_existing_id() {
        let (store, _queue) = store_with(MemoryRepository::default());
        let days: WeekDays = [Weekday::Fri].into_iter().collect();
        assert_eq!(store.create(days, seven(), None).expect("create"), 1);
        assert_eq!(store.create(days, seven(), None).expect("create"), 2);
        store.remove(1).expect("remove");
        assert_eq!(store.create(days, seven(), None).expect("create"), 3);
        store.remove(3).expect("remove");
        store.remove(2).expect("remove");
        assert_eq!(store.create(days, seven(), None).expect("create"), 1);
    }

    #[test]
    fn create_without_days_makes_one_time_alarm() {
        let (store, _queue) = store_with(MemoryRepository::default());
        let id = store
            .create(WeekDays::empty(), seven(), None)
            .expect("create");
        assert!(store.get(id).expect("alarm").one_time_only);
    }

    #[test]
    fn invalid_sound_is_rejected_without_state_change() {
        let repository = MemoryRepository::default();
        let (store, queue) = store_with(repository.clone());
        let days: WeekDays = [Weekday::Mon].into_iter().collect();
        let err = store.create(days, seven(), Some(9)).expect_err("bad sound");
        assert!(matches!(err, StoreError::InvalidSound(9)));
        assert!(store.list().is_empty());
        assert!(repository.stored.lock().expect("lock").is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn commit_persists_whole_list() {
        let repository = MemoryRepository::default();
        let (store, _queue) = store_with(repository.clone());
        let days: WeekDays = [Weekday::Tue].into_iter().collect();
        let first = store.create(days, seven(), None).expect("create");
        let second = store.create(days, seven(), Some(1)).expect("create");

        let mut tx = store.begin_transaction();
        tx.alarm_mut(first).expect("alarm").skip_once = true;
        tx.commit().expect("commit");

        let stored = repository.stored.lock().expect("lock").clone();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].skip_once);
        assert_eq!(stored[1].id, second);
    }

    #[test]
    fn dropped_transaction_discards_changes() {
        let (store, queue) = store_with(MemoryRepository::default());
        let days: WeekDays = [Weekday::Tue].into_iter().collect();
        let id = store.create(days, seven(), None).expect("create");
        queue.drain();

        {
            let mut tx = store.begin_transaction();
            tx.alarm_mut(id).expect("alarm").enabled = false;
        }
        assert!(store.get(id).expect("alarm").enabled);
        assert!(queue.drain().is_empty());
        // the lock is free again
        store.disable_all().expect("disable");
        assert!(!store.get(id).expect("alarm").enabled);
    }

    #[test]
    fn save_failure_keeps_memory_state() {
        let repository = MemoryRepository {
            fail_save: true,
            ..MemoryRepository::default()
        };
        let (store, _queue) = store_with(repository);
        let days: WeekDays = [Weekday::Sun].into_iter().collect();
        let id = store.create(days, seven(), None).expect("create");
        assert!(store.get(id).is_some());
    }

    #[test]
    fn load_failure_starts_empty() {
        let repository = MemoryRepository {
            fail_load: true,
            ..MemoryRepository::default()
        };
        let (store, queue) = store_with(repository);
        assert!(store.list().is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn loaded_alarms_are_announced_to_controller() {
        let repository = MemoryRepository::default();
        {
            let (store, _queue) = store_with(repository.clone());
            let days: WeekDays = [Weekday::Sun].into_iter().collect();
            store.create(days, seven(), None).expect("create");
        }
        let (store, queue) = store_with(repository);
        assert_eq!(store.list().len(), 1);
        assert_eq!(queue.drain(), vec![Notification::Alarm(1)]);
    }

    #[test]
    fn remove_unknown_alarm_fails() {
        let (store, _queue) = store_with(MemoryRepository::default());
        assert!(matches!(store.remove(42), Err(StoreError::UnknownAlarm(42))));
    }

    #[test]
    fn nested_transaction_on_same_thread_is_fatal() {
        let (store, _queue) = store_with(MemoryRepository::default());
        let _outer = store.begin_transaction();
        let nested = catch_unwind(AssertUnwindSafe(|| {
            let _inner = store.begin_transaction();
        }));
        assert!(nested.is_err());
    }

    #[test]
    fn transactions_from_other_threads_are_serialized() {
        let (store, _queue) = store_with(MemoryRepository::default());
        let store = Arc::new(store);
        let days: WeekDays = [Weekday::Sat].into_iter().collect();
        let handles = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.create(days, seven(), None).expect("create"))
            })
            .collect::<Vec<_>>();
        let mut ids = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect::<Vec<_>>();
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());
    }
}
