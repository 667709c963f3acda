/// `scripting/value.rs` — host ⇄ script value marshaling
///
/// Coercions:
///   bool            ⇄ boolean
///   i64             ⇄ integer
///   f64             ⇄ number
///   String / [char] ⇄ string (always UTF-8 at the boundary)
///   NativeHandle    ⇄ light userdata (never dereferenced by the host)
///
/// Tables, functions, threads and full userdata never cross back into the
/// host; `HostValue::from_script` rejects them with a structured error.
use std::ffi::c_void;

use mlua::{IntoLua, LightUserData, Lua, Result as LuaResult, Value};

use crate::error::ElgError;

// ── NativeHandle ──────────────────────────────────────────────────────────────

/// Opaque engine pointer handed to scripts as a light userdata.
///
/// Scripts can only pass it back; the host never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeHandle(usize);

impl NativeHandle {
    /// `None` for a null pointer, which scripts see as `nil`.
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        (!ptr.is_null()).then(|| Self(ptr as usize))
    }

    pub fn from_addr(addr: usize) -> Option<Self> {
        (addr != 0).then_some(Self(addr))
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

// ── HostValue ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Text(String),
    CodePoints(Vec<char>),
    Handle(NativeHandle),
}

impl HostValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Boolean(_) => "boolean",
            HostValue::Integer(_) => "integer",
            HostValue::Number(_) => "number",
            HostValue::Text(_) | HostValue::CodePoints(_) => "string",
            HostValue::Handle(_) => "lightuserdata",
        }
    }

    /// Convert a value returned by `function` into a host value.
    pub fn from_script(value: Value, function: &str) -> Result<Self, ElgError> {
        match value {
            Value::Nil => Ok(HostValue::Nil),
            Value::Boolean(b) => Ok(HostValue::Boolean(b)),
            Value::Integer(i) => Ok(HostValue::Integer(i)),
            Value::Number(n) => Ok(HostValue::Number(n)),
            Value::String(s) => {
                let text = s.to_str().map_err(|_| ElgError::InvalidUtf8 {
                    function: function.to_string(),
                })?;
                Ok(HostValue::Text(text.to_string()))
            }
            Value::LightUserData(ud) => Ok(NativeHandle::from_addr(ud.0 as usize)
                .map(HostValue::Handle)
                .unwrap_or(HostValue::Nil)),
            other => Err(ElgError::UnsupportedReturn {
                function: function.to_string(),
                found: other.type_name(),
            }),
        }
    }

    /// Characters this value contributes to an output stack, if it is textual
    /// or numeric.
    pub fn to_code_points(&self) -> Option<Vec<char>> {
        match self {
            HostValue::Text(s) => Some(s.chars().collect()),
            HostValue::CodePoints(cps) => Some(cps.clone()),
            HostValue::Integer(i) => Some(i.to_string().chars().collect()),
            HostValue::Number(n) => Some(number_to_text(*n).chars().collect()),
            HostValue::Nil | HostValue::Boolean(_) | HostValue::Handle(_) => None,
        }
    }
}

/// Shortest decimal text that parses back to exactly `n`.
///
/// Like `%g`, exponent form is used below 1e-4 and from 1e17 up.
pub fn number_to_text(n: f64) -> String {
    if n == 0.0 || !n.is_finite() {
        return format!("{n}");
    }
    let scientific = format!("{n:e}");
    let exponent = scientific
        .rsplit_once('e')
        .and_then(|(_, e)| e.parse::<i32>().ok())
        .unwrap_or(0);
    if (-4..17).contains(&exponent) {
        format!("{n}")
    } else {
        scientific
    }
}

impl IntoLua for HostValue {
    fn into_lua(self, lua: &Lua) -> LuaResult<Value> {
        Ok(match self {
            HostValue::Nil => Value::Nil,
            HostValue::Boolean(b) => Value::Boolean(b),
            HostValue::Integer(i) => Value::Integer(i),
            HostValue::Number(n) => Value::Number(n),
            HostValue::Text(s) => Value::String(lua.create_string(&s)?),
            HostValue::CodePoints(cps) => {
                let encoded: String = cps.into_iter().collect();
                Value::String(lua.create_string(&encoded)?)
            }
            HostValue::Handle(h) => Value::LightUserData(LightUserData(h.as_ptr::<c_void>())),
        })
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Boolean(b)
    }
}

impl From<i64> for HostValue {
    fn from(i: i64) -> Self {
        HostValue::Integer(i)
    }
}

impl From<i32> for HostValue {
    fn from(i: i32) -> Self {
        HostValue::Integer(i64::from(i))
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::Text(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::Text(s)
    }
}

impl From<&[char]> for HostValue {
    fn from(cps: &[char]) -> Self {
        HostValue::CodePoints(cps.to_vec())
    }
}

impl From<Option<NativeHandle>> for HostValue {
    fn from(h: Option<NativeHandle>) -> Self {
        h.map(HostValue::Handle).unwrap_or(HostValue::Nil)
    }
}
