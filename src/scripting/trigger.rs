/// `scripting/trigger.rs` — the fixed registry of extension events
///
/// An extension implements an event by defining a function under the event's
/// name in its own namespace. Which events it implements is scanned once,
/// right after its priming run, and cached in an `EventSet`.
use mlua::{Result as LuaResult, Table, Value};
use serde::{Deserialize, Serialize};

pub const EVENT_COUNT: usize = 4;

/// Events an extension may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// `load_event()` — after the priming run.
    Load,
    /// `unload_event()` — before the runtime is torn down.
    Unload,
    /// `slide_event(index) -> index`
    Slide,
    /// `token_event(index) -> index` — once per visited token.
    Token,
}

impl Event {
    pub const ALL: [Event; EVENT_COUNT] = [Event::Load, Event::Unload, Event::Slide, Event::Token];

    /// Name the script defines to implement this event.
    pub fn name(self) -> &'static str {
        match self {
            Event::Load => "load_event",
            Event::Unload => "unload_event",
            Event::Slide => "slide_event",
            Event::Token => "token_event",
        }
    }

    pub fn nargs(self) -> usize {
        match self {
            Event::Load | Event::Unload => 0,
            Event::Slide | Event::Token => 1,
        }
    }

    pub fn nresults(self) -> usize {
        match self {
            Event::Load | Event::Unload => 0,
            Event::Slide | Event::Token => 1,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_name(name: &str) -> Option<Event> {
        Event::ALL.into_iter().find(|e| e.name() == name)
    }
}

// ── EventSet ──────────────────────────────────────────────────────────────────

/// Which events an extension implements, scanned once at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSet([bool; EVENT_COUNT]);

impl EventSet {
    /// Scan `namespace` without metamethods: inherited names do not count.
    pub fn scan(namespace: &Table) -> LuaResult<Self> {
        let mut set = [false; EVENT_COUNT];
        for event in Event::ALL {
            set[event.index()] = matches!(namespace.raw_get::<Value>(event.name())?, Value::Function(_));
        }
        Ok(Self(set))
    }

    #[inline]
    pub fn implements(&self, event: Event) -> bool {
        self.0[event.index()]
    }

    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|&b| b)
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        Event::ALL.into_iter().filter(|e| self.implements(*e))
    }
}
