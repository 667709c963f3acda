/// `scripting/api.rs` — registers the reserved global tables
///
/// These names are the contract with script authors and must stay stable:
///   uConstant, uLocate, uMorphoLocate, uToken, uParser, uMatch, uString,
///   uEnvironment, uLog, U_BUFFER_SIZE
///
/// The token/parser/match functions do not interpret engine data themselves;
/// they forward typed queries to the engine's `EngineBridge`.
use std::sync::Arc;

use mlua::{Function, IntoLua, Lua, MultiValue, Result as LuaResult, Table, Value};

use super::{
    dispatch::TokenView,
    value::{HostValue, NativeHandle},
};

pub const API_VERSION: &str = "0.1.0";

pub const GLOBAL_CONSTANT: &str = "uConstant";
pub const GLOBAL_LOCATE: &str = "uLocate";
pub const GLOBAL_MORPHO_LOCATE: &str = "uMorphoLocate";
pub const GLOBAL_TOKEN: &str = "uToken";
pub const GLOBAL_PARSER: &str = "uParser";
pub const GLOBAL_MATCH: &str = "uMatch";
pub const GLOBAL_STRING: &str = "uString";
pub const GLOBAL_ENVIRONMENT: &str = "uEnvironment";
pub const GLOBAL_LOG: &str = "uLog";
pub const GLOBAL_BUFFER_SIZE: &str = "U_BUFFER_SIZE";

pub const ENVIRONMENT_LOADED: &str = "loaded";
pub const ENVIRONMENT_CALLED: &str = "called";
pub const ENVIRONMENT_VALUES: &str = "values";

/// Token bit masks published as `uToken.kBitMask`.
pub const TOKEN_BIT_MASKS: [(&str, i64); 8] = [
    ("WORD", 1),
    ("DIC", 2),
    ("UPPER", 4),
    ("LOWER", 8),
    ("FIRST", 16),
    ("CDIC", 32),
    ("NOT_DIC", 64),
    ("TDIC", 128),
];

/// Meta symbol codes published as `uToken.kMeta`.
pub const TOKEN_META: [(&str, i64); 14] = [
    ("SHARP", 0),
    ("SPACE", 1),
    ("EPSILON", 2),
    ("WORD", 3),
    ("DIC", 4),
    ("SDIC", 5),
    ("CDIC", 6),
    ("TDIC", 7),
    ("UPPER", 8),
    ("LOWER", 9),
    ("FIRST", 10),
    ("NB", 11),
    ("TOKEN", 12),
    ("LETTER", 13),
];

// ── Engine bridge ─────────────────────────────────────────────────────────────

/// `uToken.*` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenQuery {
    Current,
    Previous,
    Next,
    At(i64),
    Pos,
    Offset(i64),
    Meta { token: i64, meta: i64 },
    NegMeta { token: i64, meta: i64 },
    IsSpace(i64),
    Value(i64),
    Reference(i64),
    BitMask(i64),
    Tag(i64),
}

/// `uMatch.*` queries, each applied to a match handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchQuery {
    Begin,
    End,
    Length,
    Content,
    StartWithSpace,
    StartSentence,
    EndSentence,
    StartNewline,
    EndNewline,
}

/// Engine side of the script library. Every method defaults to `nil`.
///
/// An `Err` is raised in the calling script as a runtime error.
pub trait EngineBridge: Send + Sync {
    fn token(&self, _query: TokenQuery) -> Result<HostValue, String> {
        Ok(HostValue::Nil)
    }

    fn set_position(&self, _index: i64) -> Result<HostValue, String> {
        Ok(HostValue::Nil)
    }

    fn match_info(
        &self,
        _query: MatchQuery,
        _matches: Option<NativeHandle>,
    ) -> Result<HostValue, String> {
        Ok(HostValue::Nil)
    }
}

pub type SharedBridge = Option<Arc<dyn EngineBridge>>;

fn forward(
    lua: &Lua,
    bridge: Option<&dyn EngineBridge>,
    call: impl FnOnce(&dyn EngineBridge) -> Result<HostValue, String>,
) -> LuaResult<Value> {
    match bridge {
        None => Ok(Value::Nil),
        Some(b) => call(b).map_err(mlua::Error::RuntimeError)?.into_lua(lua),
    }
}

fn handle_arg(value: Value) -> LuaResult<Option<NativeHandle>> {
    match value {
        Value::Nil => Ok(None),
        Value::LightUserData(ud) => Ok(NativeHandle::from_addr(ud.0 as usize)),
        other => Err(mlua::Error::RuntimeError(format!(
            "expected a match handle, got {}",
            other.type_name()
        ))),
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Register every reserved global on `lua` and return `uEnvironment`.
pub fn register_all(lua: &Lua, bridge: SharedBridge) -> LuaResult<Table> {
    register_constants(lua)?;
    register_locate(lua)?;
    register_token(lua, bridge.clone())?;
    register_parser(lua, bridge.clone())?;
    register_match(lua, bridge)?;
    register_string(lua)?;
    register_log(lua)?;
    register_environment(lua)
}

fn register_constants(lua: &Lua) -> LuaResult<()> {
    let tbl = lua.create_table()?;
    tbl.set("API_VERSION", API_VERSION)?;
    lua.globals().set(GLOBAL_CONSTANT, tbl)?;
    Ok(())
}

// Field values are published right before each dispatch.
fn register_locate(lua: &Lua) -> LuaResult<()> {
    lua.globals().set(GLOBAL_LOCATE, lua.create_table_with_capacity(0, 5)?)?;
    lua.globals()
        .set(GLOBAL_MORPHO_LOCATE, lua.create_table_with_capacity(0, 10)?)?;
    Ok(())
}

fn register_token(lua: &Lua, bridge: SharedBridge) -> LuaResult<()> {
    let tbl = lua.create_table()?;

    macro_rules! token_fn {
        ($name:literal, $args:ty, |$a:pat_param| $query:expr) => {{
            let bridge = bridge.clone();
            tbl.set(
                $name,
                lua.create_function(move |lua, $a: $args| {
                    forward(lua, bridge.as_deref(), |b| b.token($query))
                })?,
            )?;
        }};
    }

    token_fn!("current", (), |()| TokenQuery::Current);
    token_fn!("previous", (), |()| TokenQuery::Previous);
    token_fn!("next", (), |()| TokenQuery::Next);
    token_fn!("at", i64, |i| TokenQuery::At(i));
    token_fn!("pos", (), |()| TokenQuery::Pos);
    token_fn!("offset", i64, |n| TokenQuery::Offset(n));
    token_fn!("meta", (i64, i64), |(token, meta)| TokenQuery::Meta { token, meta });
    token_fn!("negmeta", (i64, i64), |(token, meta)| TokenQuery::NegMeta { token, meta });
    token_fn!("is_space", i64, |t| TokenQuery::IsSpace(t));
    token_fn!("value", i64, |t| TokenQuery::Value(t));
    token_fn!("reference", i64, |t| TokenQuery::Reference(t));
    token_fn!("bitmask", i64, |t| TokenQuery::BitMask(t));
    token_fn!("tag", i64, |t| TokenQuery::Tag(t));

    // -1 until the engine publishes its sentinels
    tbl.set("U_SPACE", -1)?;
    tbl.set("U_SENTENCE", -1)?;
    tbl.set("U_STOP", -1)?;

    let masks = lua.create_table()?;
    for (name, bit) in TOKEN_BIT_MASKS {
        masks.set(name, bit)?;
    }
    tbl.set("kBitMask", masks)?;

    let meta = lua.create_table()?;
    for (name, code) in TOKEN_META {
        meta.set(name, code)?;
    }
    tbl.set("kMeta", meta)?;

    lua.globals().set(GLOBAL_TOKEN, tbl)?;
    Ok(())
}

fn register_parser(lua: &Lua, bridge: SharedBridge) -> LuaResult<()> {
    let tbl = lua.create_table()?;
    tbl.set(
        "setpos",
        lua.create_function(move |lua, index: i64| {
            forward(lua, bridge.as_deref(), |b| b.set_position(index))
        })?,
    )?;
    lua.globals().set(GLOBAL_PARSER, tbl)?;
    Ok(())
}

fn register_match(lua: &Lua, bridge: SharedBridge) -> LuaResult<()> {
    let tbl = lua.create_table()?;

    let queries = [
        ("begin", MatchQuery::Begin),
        ("fend", MatchQuery::End),
        ("length", MatchQuery::Length),
        ("content", MatchQuery::Content),
        ("start_with_space", MatchQuery::StartWithSpace),
        ("start_sentence", MatchQuery::StartSentence),
        ("end_sentence", MatchQuery::EndSentence),
        ("start_newline", MatchQuery::StartNewline),
        ("end_newline", MatchQuery::EndNewline),
    ];
    for (name, query) in queries {
        let bridge = bridge.clone();
        tbl.set(
            name,
            lua.create_function(move |lua, matches: Value| {
                let handle = handle_arg(matches)?;
                forward(lua, bridge.as_deref(), |b| b.match_info(query, handle))
            })?,
        )?;
    }

    lua.globals().set(GLOBAL_MATCH, tbl)?;
    Ok(())
}

fn register_string(lua: &Lua) -> LuaResult<()> {
    let tbl = lua.create_table()?;
    let string_format: Function = lua.globals().get::<Table>("string")?.get("format")?;
    tbl.set(
        "format",
        lua.create_function(move |_, args: MultiValue| {
            let out: mlua::String = string_format.call(args)?;
            let text = out.to_str()?.to_string();
            Ok(text)
        })?,
    )?;
    lua.globals().set(GLOBAL_STRING, tbl)?;
    Ok(())
}

fn register_log(lua: &Lua) -> LuaResult<()> {
    let tbl = lua.create_table()?;

    macro_rules! log_fn {
        ($level:expr) => {{
            lua.create_function(|_, msg: mlua::String| {
                log::log!(target: "elg::script", $level, "{}", msg.to_string_lossy());
                Ok(())
            })?
        }};
    }

    tbl.set("debug", log_fn!(log::Level::Debug))?;
    tbl.set("info", log_fn!(log::Level::Info))?;
    tbl.set("warn", log_fn!(log::Level::Warn))?;
    tbl.set("error", log_fn!(log::Level::Error))?;
    lua.globals().set(GLOBAL_LOG, tbl)?;
    Ok(())
}

fn register_environment(lua: &Lua) -> LuaResult<Table> {
    let tbl = lua.create_table()?;
    tbl.set(ENVIRONMENT_LOADED, lua.create_table()?)?;
    tbl.set(ENVIRONMENT_CALLED, lua.create_table()?)?;
    tbl.set(ENVIRONMENT_VALUES, lua.create_table()?)?;
    lua.globals().set(GLOBAL_ENVIRONMENT, tbl.clone())?;
    Ok(tbl)
}

// ── Global state slots ────────────────────────────────────────────────────────

/// Current `locate` parameters, published as `uLocate`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocateParams {
    pub state: Option<NativeHandle>,
    pub pos: i64,
    pub matches: Option<NativeHandle>,
    /// `None` is published as -1.
    pub num_matches: Option<i64>,
    pub context: Option<NativeHandle>,
}

/// Current morphological `locate` parameters, published as `uMorphoLocate`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MorphoLocateParams {
    pub state_index: i64,
    pub pos_in_tokens: i64,
    pub pos_in_chars: i64,
    pub matches: Option<NativeHandle>,
    pub num_matches: i64,
    pub context: Option<NativeHandle>,
    pub params: Option<NativeHandle>,
    pub jamo: Option<NativeHandle>,
    pub pos_in_jamo: i64,
    pub content: Option<NativeHandle>,
}

/// Publish the buffer sentinels and size.
pub fn set_special_constants(lua: &Lua, view: &TokenView<'_>) -> LuaResult<()> {
    let token: Table = lua.globals().raw_get(GLOBAL_TOKEN)?;
    token.raw_set("U_SPACE", view.space)?;
    token.raw_set("U_SENTENCE", view.sentence)?;
    token.raw_set("U_STOP", view.stop)?;
    lua.globals().raw_set(GLOBAL_BUFFER_SIZE, view.len() as i64)?;
    Ok(())
}

pub fn set_locate_call_params(lua: &Lua, p: &LocateParams) -> LuaResult<()> {
    let tbl: Table = lua.globals().raw_get(GLOBAL_LOCATE)?;
    tbl.raw_set("state", HostValue::from(p.state))?;
    tbl.raw_set("pos", p.pos)?;
    tbl.raw_set("matches", HostValue::from(p.matches))?;
    tbl.raw_set("num_matches", p.num_matches.unwrap_or(-1))?;
    tbl.raw_set("context", HostValue::from(p.context))?;
    Ok(())
}

pub fn set_morpho_locate_call_params(lua: &Lua, p: &MorphoLocateParams) -> LuaResult<()> {
    let tbl: Table = lua.globals().raw_get(GLOBAL_MORPHO_LOCATE)?;
    tbl.raw_set("state_index", p.state_index)?;
    tbl.raw_set("pos_in_tokens", p.pos_in_tokens)?;
    tbl.raw_set("pos_in_chars", p.pos_in_chars)?;
    tbl.raw_set("matches", HostValue::from(p.matches))?;
    tbl.raw_set("num_matches", p.num_matches)?;
    tbl.raw_set("context", HostValue::from(p.context))?;
    tbl.raw_set("params", HostValue::from(p.params))?;
    tbl.raw_set("jamo", HostValue::from(p.jamo))?;
    tbl.raw_set("pos_in_jamo", p.pos_in_jamo)?;
    tbl.raw_set("content", HostValue::from(p.content))?;
    Ok(())
}
