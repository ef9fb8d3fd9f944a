use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

/// Message for the controller thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The alarm with this id was created, edited or removed. The controller
    /// looks the alarm up again, so repeated notifications are harmless.
    Alarm(u32),
    Command(ControlCommand),
}

/// Immediate request executed on the controller thread, the only place
/// where sound and light outputs are driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    StopActiveAlarm,
    AllOff { disable_alarms: bool },
    SoundOn,
    SoundOff,
    PlaySound(usize),
    SetVolume(u8),
    Light { id: u32, action: LightAction },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightAction {
    Brightness(u8),
    Off,
    DimUp { target: u8, seconds: u32 },
}

/// Producer side of the processing queue. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: Sender<Notification>,
}

/// Consumer side, owned by the controller.
#[derive(Debug)]
pub struct ProcessingQueue {
    receiver: Receiver<Notification>,
}

pub fn processing_queue() -> (Notifier, ProcessingQueue) {
    let (sender, receiver) = crossbeam_channel::unbounded();
    (Notifier { sender }, ProcessingQueue { receiver })
}

impl Notifier {
    pub fn alarm_changed(&self, alarm_id: u32) {
        self.send(Notification::Alarm(alarm_id));
    }

    pub fn command(&self, command: ControlCommand) {
        self.send(Notification::Command(command));
    }

    fn send(&self, notification: Notification) {
        if let Err(err) = self.sender.send(notification) {
            // Only possible once the controller has shut down.
            debug!("dropping notification {:?}: controller stopped", err.0);
        }
    }
}

impl ProcessingQueue {
    /// Removes and returns everything queued so far, in enqueue order.
    pub fn drain(&self) -> Vec<Notification> {
        self.receiver.try_iter().collect()
    }
}
