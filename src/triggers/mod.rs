use log::debug;

/// Protocol milestones an automation layer can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum P1Event {
    /// Waiting for the first byte of a new telegram.
    ReadyToReceive,
    /// A telegram has started to arrive.
    ReceivingUpdate,
    /// A complete telegram passed the checksum check.
    UpdateReceived,
    /// All values of the telegram were handed to the sensors.
    UpdateProcessed,
    /// The telegram was dropped and the reader is recovering.
    CommunicationError,
}

pub trait P1Observer {
    fn on_event(&mut self, event: P1Event);
}

impl<F: FnMut(P1Event)> P1Observer for F {
    fn on_event(&mut self, event: P1Event) {
        self(event)
    }
}

/// Observers notified synchronously on every state change.
pub struct Triggers {
    observers: Vec<Box<dyn P1Observer>>,
}

impl Triggers {
    pub fn new() -> Self {
        return Triggers { observers: Vec::new() };
    }

    pub fn subscribe(&mut self, observer: Box<dyn P1Observer>) {
        self.observers.push(observer);
    }

    /// Run `action` only for one kind of event.
    pub fn on<F: FnMut() + 'static>(&mut self, event: P1Event, mut action: F) {
        self.subscribe(Box::new(move |e: P1Event| {
            if e == event {
                action();
            }
        }));
    }

    pub fn fire(&mut self, event: P1Event) {
        debug!("Trigger {:?} ({} observers)", event, self.observers.len());
        for observer in self.observers.iter_mut() {
            observer.on_event(event);
        }
    }
}
