/// `scripting/mirror.rs` — isolated calls into extension functions
///
/// A function called from the engine runs with a throwaway call layer (`_F`)
/// as its environment. Writes made during the call land in that layer. When
/// the call does not reject, the layer's bindings are merged into the session
/// local layer so later calls observe them; when it rejects, they are dropped.
/// The function's own environment is put back however the call ends.
use mlua::{Function, IntoLua, Lua, MultiValue, Table, Value};

use super::{
    dispatch::Invocations,
    sandbox::{build_sandbox, CALL_LAYER},
    value::{HostValue, NativeHandle},
};
use crate::error::{script_message, ElgError};

/// How the engine should continue after a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// `nil` or `false`: the transition is not taken.
    Reject,
    /// `true`: taken, nothing emitted.
    Proceed,
    /// Number or string: taken, this many characters pushed to the output.
    Emitted(usize),
    /// Light userdata handed back to the engine.
    Handle(NativeHandle),
}

impl CallOutcome {
    pub fn advances(&self) -> bool {
        !matches!(self, CallOutcome::Reject)
    }
}

/// A function whose environment is swapped for a fresh call layer.
pub struct MirrorFrame<'a> {
    function: &'a Function,
    layer: Table,
    saved: Option<Table>,
}

impl<'a> MirrorFrame<'a> {
    /// Build a call layer under `parent` and install it as the environment
    /// of `function`.
    pub fn open(lua: &Lua, parent: &Table, function: &'a Function) -> Result<Self, ElgError> {
        let layer = build_sandbox(lua, parent, CALL_LAYER)?;
        let saved = function.environment();
        if saved.is_some() {
            function.set_environment(layer.clone())?;
        }
        Ok(Self {
            function,
            layer,
            saved,
        })
    }

    pub fn layer(&self) -> &Table {
        &self.layer
    }

    pub fn call(&self, args: MultiValue, name: &str) -> Result<Value, ElgError> {
        self.function.call::<Value>(args).map_err(|e| ElgError::Call {
            function: name.to_string(),
            message: script_message(&e),
        })
    }

    /// Copy the layer's own bindings, except its self reference, into `target`.
    pub fn merge_into(&self, target: &Table) -> Result<usize, ElgError> {
        let mut merged = 0;
        for pair in self.layer.clone().pairs::<Value, Value>() {
            let (key, value) = pair?;
            if let Value::String(s) = &key {
                if &*s.as_bytes() == CALL_LAYER.as_bytes() {
                    continue;
                }
            }
            target.raw_set(key, value)?;
            merged += 1;
        }
        Ok(merged)
    }
}

impl Drop for MirrorFrame<'_> {
    fn drop(&mut self) {
        if let Some(env) = self.saved.take() {
            if let Err(err) = self.function.set_environment(env) {
                log::error!("[elg] cannot restore function environment: {err}");
            }
        }
    }
}

/// Classify the value returned by `function`, pushing emitted characters
/// onto `output`.
pub fn classify(value: Value, function: &str, output: &mut Vec<char>) -> Result<CallOutcome, ElgError> {
    let value = HostValue::from_script(value, function)?;
    Ok(match value {
        HostValue::Nil | HostValue::Boolean(false) => CallOutcome::Reject,
        HostValue::Boolean(true) => CallOutcome::Proceed,
        HostValue::Handle(h) => CallOutcome::Handle(h),
        HostValue::Integer(_) | HostValue::Number(_) | HostValue::Text(_) | HostValue::CodePoints(_) => {
            let chars = value.to_code_points().unwrap_or_default();
            let count = chars.len();
            output.extend(chars);
            CallOutcome::Emitted(count)
        }
    })
}

/// Run `function` from extension layer `namespace` in mirror mode.
#[allow(clippy::too_many_arguments)]
pub fn mirror_call(
    lua: &Lua,
    namespace: &Table,
    local: &Table,
    function: &Function,
    name: &str,
    args: &[HostValue],
    output: &mut Vec<char>,
    calls: &Invocations,
) -> Result<CallOutcome, ElgError> {
    let args = args
        .iter()
        .cloned()
        .map(|a| a.into_lua(lua))
        .collect::<mlua::Result<MultiValue>>()?;

    let frame = MirrorFrame::open(lua, namespace, function)?;
    calls.bump();
    let result = frame.call(args, name)?;
    let outcome = classify(result, name, output)?;
    if outcome.advances() {
        let merged = frame.merge_into(local)?;
        if merged > 0 {
            log::trace!("[elg] {name}: {merged} binding(s) kept");
        }
    }
    Ok(outcome)
}
