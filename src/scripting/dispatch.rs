/// `scripting/dispatch.rs` — event dispatch and token interception
///
/// Generic dispatch looks an event up by name in any namespace and calls it
/// if it is a function. The main extension (the script attached to the graph
/// being run) has its implemented events cached in an `EventSet`, so hot-path
/// dispatch of an unimplemented event never reaches the runtime.
use std::{cell::Cell, path::PathBuf};

use mlua::{MultiValue, Table, Value};

use super::trigger::{Event, EventSet};
use crate::{
    config::AdvancePolicy,
    error::{script_message, ElgError},
};

// ── Invocations ───────────────────────────────────────────────────────────────

/// Number of times the host entered the script runtime.
#[derive(Debug, Default)]
pub struct Invocations(Cell<u64>);

impl Invocations {
    #[inline]
    pub fn bump(&self) {
        self.0.set(self.0.get() + 1);
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

/// Call `event_name` in `namespace` if, and only if, it is a function there.
///
/// Inherited names are ignored. Returns `None` when nothing was called.
pub fn call_event(
    namespace: &Table,
    extension: &str,
    event_name: &str,
    args: MultiValue,
    calls: &Invocations,
) -> Result<Option<Value>, ElgError> {
    let Value::Function(handler) = namespace.raw_get::<Value>(event_name)? else {
        return Ok(None);
    };
    calls.bump();
    log::debug!("[elg] {extension}: {event_name}");
    handler
        .call::<Value>(args)
        .map(Some)
        .map_err(|e| ElgError::Event {
            extension: extension.to_string(),
            event: event_name.to_string(),
            message: script_message(&e),
        })
}

// ── Token buffer ──────────────────────────────────────────────────────────────

/// Read-only view of the engine's token buffer.
#[derive(Debug, Clone, Copy)]
pub struct TokenView<'a> {
    pub buffer: &'a [i32],
    /// Valid token ids are `0..token_count`.
    pub token_count: i32,
    pub space: i32,
    pub sentence: i32,
    pub stop: i32,
}

impl TokenView<'_> {
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn token_at(&self, index: i64) -> Result<i32, ElgError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.buffer.get(i).copied())
            .ok_or(ElgError::PositionOutOfBuffer {
                index,
                size: self.len(),
            })
    }

    /// In bounds and holding a real token id.
    fn accepts(&self, index: i64) -> bool {
        self.token_at(index)
            .map(|t| t >= 0 && t < self.token_count)
            .unwrap_or(false)
    }

    fn has_next(&self, index: i64) -> bool {
        index + 1 < self.len() as i64
    }
}

/// Engine scan position: the absolute index is `origin + pos`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub pos: i64,
    pub origin: i64,
}

impl Cursor {
    pub fn new(pos: i64, origin: i64) -> Self {
        Self { pos, origin }
    }

    pub fn index(&self) -> i64 {
        self.origin + self.pos
    }
}

// ── Main extension ────────────────────────────────────────────────────────────

/// The extension attached to the active graph.
#[derive(Debug)]
pub struct MainExtension {
    pub path: PathBuf,
    pub namespace: Table,
    pub events: EventSet,
}

impl MainExtension {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    /// Dispatch `event` if this extension implements it.
    pub fn dispatch(
        &self,
        event: Event,
        args: MultiValue,
        calls: &Invocations,
    ) -> Result<Option<Value>, ElgError> {
        if !self.events.implements(event) {
            return Ok(None);
        }
        if args.len() != event.nargs() {
            return Err(ElgError::Arity {
                event: event.name(),
                expected: event.nargs(),
                found: args.len(),
            });
        }
        call_event(&self.namespace, &self.label(), event.name(), args, calls)
    }

    /// Run `token_event` at the cursor and apply the index it returns.
    ///
    /// A different index is only accepted if it is in the buffer and holds a
    /// valid token id. It is then snapped forward past a non-space token and
    /// past a following space, so the cursor lands on a space-delimited
    /// boundary. When the cursor sits at `pos == 0` the origin moves instead.
    pub fn token_event(
        &self,
        view: &TokenView<'_>,
        cursor: &mut Cursor,
        policy: AdvancePolicy,
        calls: &Invocations,
    ) -> Result<i32, ElgError> {
        let index = cursor.index();
        let args = MultiValue::from_iter([Value::Integer(index)]);
        let Some(result) = self.dispatch(Event::Token, args, calls)? else {
            return view.token_at(index);
        };

        let proposed = integer_result(Event::Token, result)?;
        if proposed != index {
            advance(view, cursor, proposed, policy)?;
        }
        view.token_at(cursor.index())
    }

    /// Run `slide_event(index)`; the input comes back when not implemented.
    pub fn slide_event(&self, index: i64, calls: &Invocations) -> Result<i64, ElgError> {
        let args = MultiValue::from_iter([Value::Integer(index)]);
        match self.dispatch(Event::Slide, args, calls)? {
            Some(result) => integer_result(Event::Slide, result),
            None => Ok(index),
        }
    }
}

fn integer_result(event: Event, value: Value) -> Result<i64, ElgError> {
    match value {
        Value::Integer(i) => Ok(i),
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Ok(n as i64),
        other => Err(ElgError::BadIndex {
            event: event.name(),
            found: other.type_name().to_string(),
        }),
    }
}

fn advance(
    view: &TokenView<'_>,
    cursor: &mut Cursor,
    proposed: i64,
    policy: AdvancePolicy,
) -> Result<(), ElgError> {
    if !view.accepts(proposed) {
        match policy {
            AdvancePolicy::Ignore => {}
            AdvancePolicy::Warn => log::warn!(
                "[elg] token_event index {proposed} ignored: out of the bounds (buffer size {})",
                view.len()
            ),
            AdvancePolicy::Reject => {
                return Err(ElgError::AdvanceOutOfBounds {
                    index: proposed,
                    size: view.len(),
                })
            }
        }
        return Ok(());
    }

    let mut index = proposed;
    if view.token_at(index)? != view.space && view.has_next(index) {
        index += 1;
    }
    if view.token_at(index)? == view.space && view.has_next(index) {
        index += 1;
    }

    if cursor.pos == 0 {
        // nothing can match before the skipped range
        cursor.origin = index;
    } else {
        cursor.pos = index - cursor.origin;
    }
    Ok(())
}
