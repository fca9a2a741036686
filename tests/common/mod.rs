//! Shared helpers for the integration tests.

use std::sync::{Arc, Mutex};

use armature::{Cause, HookInfo, RunnerListener};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Start(&'static str),
    Ready(&'static str),
    Close(&'static str),
    Done(&'static str),
    Shutdown,
}

/// Records listener events with the hook tags used by the tests.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Index of the first occurrence, or a panic naming the missing event.
    pub fn index_of(&self, event: &Event) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("event {event:?} not found in {events:?}"))
    }

    pub fn count_of(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn contains(&self, event: &Event) -> bool {
        self.events().iter().any(|e| e == event)
    }

    fn label(hook: &HookInfo) -> &'static str {
        hook.tag()
            .and_then(|tag| tag.downcast_ref::<&'static str>())
            .copied()
            .unwrap_or("<untagged>")
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl RunnerListener for Recorder {
    fn on_start(&self, hook: &HookInfo) {
        self.push(Event::Start(Self::label(hook)));
    }

    fn on_ready(&self, hook: &HookInfo) {
        self.push(Event::Ready(Self::label(hook)));
    }

    fn on_close(&self, hook: &HookInfo, _cause: Option<&Cause>) {
        self.push(Event::Close(Self::label(hook)));
    }

    fn on_done(&self, hook: &HookInfo, _result: Option<&Cause>) {
        self.push(Event::Done(Self::label(hook)));
    }

    fn on_shutdown(&self, _cause: &Cause) {
        self.push(Event::Shutdown);
    }
}
