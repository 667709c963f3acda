/// `scripting/extension.rs` — extension cache and loader
///
/// An extension is loaded at most once per runtime. Loading compiles the
/// script into its own sandbox layer, registers the layer under
/// `uEnvironment.loaded["elg-<name>"]` so the script can see itself, runs the
/// chunk once (the priming run), scans its events and calls `load_event`.
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use mlua::{Function, Lua, MultiValue, Table, Value};

use super::{
    api::ENVIRONMENT_LOADED,
    dispatch::{call_event, Invocations},
    sandbox::{build_sandbox, EXTENSION_LAYER},
    source::ScriptSource,
    trigger::{Event, EventSet},
};
use crate::error::{script_message, ElgError};

/// Prefix of every cache key.
pub const CACHE_PREFIX: &str = "elg";

pub fn cache_key(name: &str) -> String {
    format!("{CACHE_PREFIX}-{name}")
}

/// Everything a load needs from the running session.
pub struct LoadContext<'a> {
    pub lua: &'a Lua,
    pub source: &'a dyn ScriptSource,
    /// Parent of every extension layer.
    pub local: &'a Table,
    /// The `uEnvironment` table.
    pub environment: &'a Table,
    pub calls: &'a Invocations,
}

#[derive(Debug)]
pub struct Extension {
    name: String,
    key: String,
    path: PathBuf,
    namespace: Table,
    events: EventSet,
}

impl Extension {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn namespace(&self) -> &Table {
        &self.namespace
    }

    pub fn events(&self) -> EventSet {
        self.events
    }

    /// Call `unload_event` if implemented.
    pub fn unload(&self, calls: &Invocations) -> Result<(), ElgError> {
        if self.events.implements(Event::Unload) {
            call_event(&self.namespace, &self.key, Event::Unload.name(), MultiValue::new(), calls)?;
        }
        Ok(())
    }
}

// ── Priming ───────────────────────────────────────────────────────────────────

/// Compile `path` into a fresh layer under `parent`, run it once, scan its
/// events and run `load_event`.
///
/// `register` sees the layer before the chunk runs.
#[allow(clippy::too_many_arguments)]
pub(crate) fn prime(
    lua: &Lua,
    source: &dyn ScriptSource,
    path: &Path,
    label: &str,
    parent: &Table,
    layer_key: &str,
    calls: &Invocations,
    register: impl FnOnce(&Table) -> Result<(), ElgError>,
) -> Result<(Table, EventSet), ElgError> {
    if !source.exists(path) {
        return Err(ElgError::ExtensionNotFound {
            extension: label.to_string(),
            path: path.to_path_buf(),
        });
    }
    let bytes = source.read(path).map_err(|source| ElgError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let namespace = build_sandbox(lua, parent, layer_key)?;
    let chunk = lua
        .load(bytes)
        .set_name(format!("@{}", path.display()))
        .set_environment(namespace.clone())
        .into_function()
        .map_err(|e| ElgError::Compile {
            extension: label.to_string(),
            message: script_message(&e),
        })?;

    register(&namespace)?;

    calls.bump();
    chunk.call::<()>(()).map_err(|e| ElgError::Priming {
        extension: label.to_string(),
        message: script_message(&e),
    })?;

    let events = EventSet::scan(&namespace)?;
    if events.implements(Event::Load) {
        call_event(&namespace, label, Event::Load.name(), MultiValue::new(), calls)?;
    }
    Ok((namespace, events))
}

// ── ExtensionCache ────────────────────────────────────────────────────────────

/// Loaded extensions of one runtime, in load order.
#[derive(Debug, Default)]
pub struct ExtensionCache {
    entries: HashMap<String, Extension>,
    order: Vec<String>,
    counter: i64,
}

impl ExtensionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Extension> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Loaded extensions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Extension> + '_ {
        self.order.iter().filter_map(|name| self.entries.get(name))
    }

    /// Load `name` unless it is already cached.
    pub fn load(&mut self, ctx: &LoadContext<'_>, name: &str) -> Result<&Extension, ElgError> {
        if !self.entries.contains_key(name) {
            let extension = Self::load_fresh(ctx, name)?;
            self.counter += 1;
            ctx.environment
                .get::<Table>(ENVIRONMENT_LOADED)?
                .raw_set(self.counter, extension.key.as_str())?;
            log::info!("[elg] loaded {} from {}", extension.key, extension.path.display());
            self.order.push(name.to_string());
            self.entries.insert(name.to_string(), extension);
        }
        self.entries
            .get(name)
            .ok_or_else(|| ElgError::ExtensionNotFound {
                extension: name.to_string(),
                path: ctx.source.locate(name),
            })
    }

    /// Load `name` and resolve `function` through its namespace.
    pub fn load_function(
        &mut self,
        ctx: &LoadContext<'_>,
        name: &str,
        function: &str,
    ) -> Result<Function, ElgError> {
        let extension = self.load(ctx, name)?;
        match extension.namespace.get::<Value>(function)? {
            Value::Function(f) => Ok(f),
            _ => Err(ElgError::MissingFunction {
                extension: name.to_string(),
                function: function.to_string(),
            }),
        }
    }

    /// Take every extension out of the cache, oldest first.
    pub fn drain(&mut self) -> Vec<Extension> {
        let mut entries = std::mem::take(&mut self.entries);
        self.order
            .drain(..)
            .filter_map(|name| entries.remove(&name))
            .collect()
    }

    fn load_fresh(ctx: &LoadContext<'_>, name: &str) -> Result<Extension, ElgError> {
        let key = cache_key(name);
        let path = ctx.source.locate(name);
        let loaded: Table = ctx.environment.get(ENVIRONMENT_LOADED)?;

        let primed = prime(
            ctx.lua,
            ctx.source,
            &path,
            name,
            ctx.local,
            EXTENSION_LAYER,
            ctx.calls,
            |namespace| Ok(loaded.raw_set(key.as_str(), namespace.clone())?),
        );
        match primed {
            Ok((namespace, events)) => Ok(Extension {
                name: name.to_string(),
                key,
                path,
                namespace,
                events,
            }),
            Err(err) => {
                loaded.raw_set(key.as_str(), Value::Nil)?;
                log::warn!("[elg] {err}");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::scripting::{api::register_all, sandbox::LOCAL_LAYER, source::MemorySource};

    struct Fixture {
        lua: Lua,
        local: Table,
        environment: Table,
        calls: Invocations,
        source: MemorySource,
    }

    impl Fixture {
        fn new(source: MemorySource) -> Self {
            let lua = Lua::new();
            let environment = register_all(&lua, None).unwrap();
            let local = build_sandbox(&lua, &lua.globals(), LOCAL_LAYER).unwrap();
            Self {
                lua,
                local,
                environment,
                calls: Invocations::default(),
                source,
            }
        }

        fn ctx(&self) -> LoadContext<'_> {
            LoadContext {
                lua: &self.lua,
                source: &self.source,
                local: &self.local,
                environment: &self.environment,
                calls: &self.calls,
            }
        }
    }

    fn scripts() -> MemorySource {
        MemorySource::new("scripts", ".upp")
            .with_extension(
                "dates",
                r#"
                uEnvironment.values.primed = (uEnvironment.values.primed or 0) + 1
                function load_event()
                    uEnvironment.values.loads = (uEnvironment.values.loads or 0) + 1
                end
                function year(s) return s:sub(1, 4) end
                "#,
            )
            .with_extension("broken", "function f( return end")
            .with_extension("raises", "error('cannot prime')")
            .with_extension(
                "selfref",
                "seen = uEnvironment.loaded['elg-selfref'] ~= nil",
            )
    }

    fn value(lua: &Lua, name: &str) -> Value {
        lua.load(format!("return uEnvironment.values.{name}")).eval().unwrap()
    }

    #[test]
    fn load_is_idempotent() {
        let fx = Fixture::new(scripts());
        let mut cache = ExtensionCache::new();
        cache.load(&fx.ctx(), "dates").unwrap();
        cache.load(&fx.ctx(), "dates").unwrap();
        cache.load_function(&fx.ctx(), "dates", "year").unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(value(&fx.lua, "primed"), Value::Integer(1));
        assert_eq!(value(&fx.lua, "loads"), Value::Integer(1));
        let first: String = fx.lua.load("return uEnvironment.loaded[1]").eval().unwrap();
        assert_eq!(first, "elg-dates");
    }

    #[test]
    fn resolved_function_runs_in_its_layer() {
        let fx = Fixture::new(scripts());
        let mut cache = ExtensionCache::new();
        let year = cache.load_function(&fx.ctx(), "dates", "year").unwrap();
        assert_eq!(year.call::<String>("2024-05-01").unwrap(), "2024");
        assert!(cache.get("dates").unwrap().events().implements(Event::Load));
    }

    #[test]
    fn missing_script_is_a_load_error() {
        let fx = Fixture::new(scripts());
        let mut cache = ExtensionCache::new();
        let err = cache.load(&fx.ctx(), "absent").unwrap_err();
        assert!(matches!(err, ElgError::ExtensionNotFound { .. }));
        assert_eq!(err.class(), ErrorClass::Load);
        assert!(cache.is_empty());
    }

    #[test]
    fn syntax_and_priming_errors_leave_no_trace() {
        let fx = Fixture::new(scripts());
        let mut cache = ExtensionCache::new();

        let err = cache.load(&fx.ctx(), "broken").unwrap_err();
        assert!(matches!(err, ElgError::Compile { ref extension, .. } if extension == "broken"));

        let err = cache.load(&fx.ctx(), "raises").unwrap_err();
        match err {
            ElgError::Priming { message, .. } => assert!(message.contains("cannot prime")),
            other => panic!("unexpected error {other}"),
        }

        assert!(cache.is_empty());
        let leftover: Value = fx
            .lua
            .load("return uEnvironment.loaded['elg-raises']")
            .eval()
            .unwrap();
        assert_eq!(leftover, Value::Nil);
    }

    #[test]
    fn missing_function_is_reported_after_load() {
        let fx = Fixture::new(scripts());
        let mut cache = ExtensionCache::new();
        let err = cache.load_function(&fx.ctx(), "dates", "month").unwrap_err();
        assert!(matches!(err, ElgError::MissingFunction { ref function, .. } if function == "month"));
        assert!(cache.contains("dates"), "the extension itself stays loaded");
    }

    #[test]
    fn extension_sees_itself_while_priming() {
        let fx = Fixture::new(scripts());
        let mut cache = ExtensionCache::new();
        let ext = cache.load(&fx.ctx(), "selfref").unwrap();
        let seen: bool = ext.namespace().raw_get("seen").unwrap();
        assert!(seen);
    }

    #[test]
    fn globals_written_while_priming_stay_in_the_layer() {
        let src = MemorySource::new("scripts", ".upp").with_extension("w", "counter = 7");
        let fx = Fixture::new(src);
        let mut cache = ExtensionCache::new();
        cache.load(&fx.ctx(), "w").unwrap();
        assert_eq!(fx.lua.globals().raw_get::<Value>("counter").unwrap(), Value::Nil);
        assert_eq!(fx.local.raw_get::<Value>("counter").unwrap(), Value::Nil);
    }

    #[test]
    fn drain_keeps_load_order() {
        let src = MemorySource::new("scripts", ".upp")
            .with_extension("b", "")
            .with_extension("a", "")
            .with_extension("c", "");
        let fx = Fixture::new(src);
        let mut cache = ExtensionCache::new();
        for name in ["b", "a", "c"] {
            cache.load(&fx.ctx(), name).unwrap();
        }
        let names: Vec<_> = cache.drain().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert!(cache.is_empty());
    }
}
