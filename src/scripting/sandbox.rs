/// `scripting/sandbox.rs` — runtime creation and namespace layers
///
/// A session runtime is created with a trust-dependent set of standard
/// libraries. Scripts never run against the real globals: each one gets a
/// namespace layer whose failed lookups fall back to a single parent table.
///
///   _G (globals) ← _L (session local) ← _E (extension) ← _F (one call)
///   _G (globals) ← _S (main extension)
///
/// Writes always land in the innermost layer; nothing ever sets `__newindex`.
use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Table};
use serde::{Deserialize, Serialize};

pub const GLOBAL_LAYER: &str = "_G";
pub const LOCAL_LAYER: &str = "_L";
pub const EXTENSION_LAYER: &str = "_E";
pub const MAIN_LAYER: &str = "_S";
pub const CALL_LAYER: &str = "_F";

/// Controls which Lua standard libraries are available to scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// string, table, math, utf8, coroutine — no I/O or OS
    #[default]
    Basic,
    /// Basic + io
    FileRead,
    /// Every safe library, including os and package (`require`)
    Elevated,
}

impl TrustLevel {
    pub fn std_libs(self) -> StdLib {
        let basic = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
        match self {
            TrustLevel::Basic => basic,
            TrustLevel::FileRead => basic | StdLib::IO,
            TrustLevel::Elevated => basic | StdLib::IO | StdLib::OS | StdLib::PACKAGE,
        }
    }
}

/// Creates a new Lua runtime with the libraries allowed by `trust`.
pub fn create_runtime(trust: TrustLevel) -> LuaResult<Lua> {
    Lua::new_with(trust.std_libs(), LuaOptions::default())
}

/// Builds a namespace layer on top of `parent`.
///
/// The returned table has a metatable whose `__index` is `parent`, and holds
/// itself under `layer_key` so scripts can name their own scope. The caller
/// installs it as the environment of a chunk or function.
pub fn build_sandbox(lua: &Lua, parent: &Table, layer_key: &str) -> LuaResult<Table> {
    let namespace = lua.create_table()?;
    let fallback = lua.create_table()?;
    fallback.raw_set("__index", parent.clone())?;
    namespace.set_metatable(Some(fallback));
    namespace.raw_set(layer_key, namespace.clone())?;
    Ok(namespace)
}
