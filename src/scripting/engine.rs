/// `scripting/engine.rs` — script runtime lifecycle
///
/// `Session` owns at most one live runtime. Starting it creates the runtime
/// with the configured standard libraries, runs the bootstrap script,
/// registers the reserved API tables and creates the session local layer.
/// Stopping it unloads the main extension, then every cached extension in
/// load order, and drops the runtime. Nothing created by one runtime is
/// reachable from the next.
use std::{path::Path, sync::Arc};

use mlua::{IntoLua, Lua, MultiValue, Table, Value};

use super::{
    api::{
        register_all, set_locate_call_params, set_morpho_locate_call_params,
        set_special_constants, EngineBridge, LocateParams, MorphoLocateParams, SharedBridge,
        API_VERSION, ENVIRONMENT_CALLED, ENVIRONMENT_VALUES,
    },
    dispatch::{call_event, Cursor, Invocations, MainExtension, TokenView},
    extension::{prime, Extension, ExtensionCache, LoadContext},
    mirror::{mirror_call, CallOutcome},
    sandbox::{build_sandbox, create_runtime, LOCAL_LAYER, MAIN_LAYER},
    source::{main_extension_path, DirectorySource, ScriptSource},
    trigger::{Event, EventSet},
    value::HostValue,
};
use crate::{
    config::HostConfig,
    error::{abort_handler, script_message, ElgError, FatalHandler},
};

/// Runs once per runtime when no bootstrap file is configured.
///
/// Only plain `.lua` modules are searchable; extension scripts are loaded
/// through the cache, never through `require`.
const DEFAULT_BOOTSTRAP: &str = r#"
local script_dir = ...
if package then
    local sep = package.config:sub(1, 1)
    package.path = script_dir .. sep .. "?.lua;" .. package.path
end
"#;

// ── Runtime ───────────────────────────────────────────────────────────────────

/// Tables and counters tied to one live runtime.
///
/// Field order matters: every handle is dropped before `lua`.
struct Scope {
    environment: Table,
    local: Table,
    calls: Invocations,
    lua: Lua,
}

struct Runtime {
    cache: ExtensionCache,
    main: Option<MainExtension>,
    scope: Scope,
}

impl Runtime {
    fn split<'a>(&'a mut self, source: &'a dyn ScriptSource) -> (&'a mut ExtensionCache, LoadContext<'a>) {
        let ctx = LoadContext {
            lua: &self.scope.lua,
            source,
            local: &self.scope.local,
            environment: &self.scope.environment,
            calls: &self.scope.calls,
        };
        (&mut self.cache, ctx)
    }

    fn values(&self, args: &[HostValue]) -> Result<MultiValue, ElgError> {
        Ok(args
            .iter()
            .cloned()
            .map(|a| a.into_lua(&self.scope.lua))
            .collect::<mlua::Result<MultiValue>>()?)
    }

    fn count_call(&self, extension: &str, function: &str) -> Result<(), ElgError> {
        let called: Table = self.scope.environment.get(ENVIRONMENT_CALLED)?;
        let key = format!("{extension}.{function}");
        let count = called.raw_get::<Option<i64>>(key.as_str())?.unwrap_or(0);
        called.raw_set(key, count + 1)?;
        Ok(())
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

pub struct Session {
    config: HostConfig,
    source: Box<dyn ScriptSource>,
    bridge: SharedBridge,
    fatal_handler: FatalHandler,
    runtime: Option<Runtime>,
}

impl Session {
    pub fn new(config: HostConfig, source: impl ScriptSource + 'static) -> Self {
        Self {
            config,
            source: Box::new(source),
            bridge: None,
            fatal_handler: abort_handler(),
            runtime: None,
        }
    }

    /// Session reading `<script_dir>/<name><extension_suffix>` from disk.
    pub fn from_config(config: HostConfig) -> Self {
        let source = DirectorySource::new(&config.script_dir, config.extension_suffix.as_str());
        Self::new(config, source)
    }

    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.fatal_handler = handler;
        self
    }

    /// Engine callbacks used by `uToken`, `uParser` and `uMatch`.
    ///
    /// Takes effect at the next (re)start.
    pub fn set_bridge(&mut self, bridge: Arc<dyn EngineBridge>) {
        self.bridge = Some(bridge);
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Hand `err` to the fatal handler.
    pub fn fatal(&self, err: &ElgError) {
        (self.fatal_handler)(err);
    }

    pub fn lua(&self) -> Option<&Lua> {
        self.runtime.as_ref().map(|rt| &rt.scope.lua)
    }

    /// The session local layer (`_L`).
    pub fn local_namespace(&self) -> Option<&Table> {
        self.runtime.as_ref().map(|rt| &rt.scope.local)
    }

    /// Script invocations made by the current runtime.
    pub fn script_invocations(&self) -> u64 {
        self.runtime.as_ref().map_or(0, |rt| rt.scope.calls.get())
    }

    pub fn extension(&self, name: &str) -> Option<&Extension> {
        self.runtime.as_ref().and_then(|rt| rt.cache.get(name))
    }

    /// Names of loaded extensions, oldest first.
    pub fn loaded_extensions(&self) -> Vec<&str> {
        self.runtime
            .as_ref()
            .map(|rt| rt.cache.iter().map(Extension::name).collect())
            .unwrap_or_default()
    }

    fn runtime(&self) -> Result<&Runtime, ElgError> {
        self.runtime.as_ref().ok_or(ElgError::NotRunning)
    }

    fn parts(&mut self) -> Result<(&dyn ScriptSource, &mut Runtime), ElgError> {
        match &mut self.runtime {
            Some(rt) => Ok((self.source.as_ref(), rt)),
            None => Err(ElgError::NotRunning),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    pub fn start(&mut self) -> Result<(), ElgError> {
        self.restart()
    }

    /// Stop the current runtime, if any, and create a fresh one.
    pub fn restart(&mut self) -> Result<(), ElgError> {
        if self.is_running() {
            self.stop()?;
        }

        let lua = create_runtime(self.config.trust).map_err(ElgError::RuntimeCreation)?;
        self.run_bootstrap(&lua)?;
        let environment = register_all(&lua, self.bridge.clone())?;
        let local = build_sandbox(&lua, &lua.globals(), LOCAL_LAYER)?;

        self.runtime = Some(Runtime {
            cache: ExtensionCache::new(),
            main: None,
            scope: Scope {
                environment,
                local,
                calls: Invocations::default(),
                lua,
            },
        });
        log::info!(
            "[elg] runtime started (API {API_VERSION}, trust {:?})",
            self.config.trust
        );
        Ok(())
    }

    fn run_bootstrap(&self, lua: &Lua) -> Result<(), ElgError> {
        match &self.config.bootstrap {
            None => {
                let script_dir = self.config.script_dir.to_string_lossy().into_owned();
                lua.load(DEFAULT_BOOTSTRAP)
                    .set_name("=bootstrap")
                    .call::<()>(script_dir)
                    .map_err(|e| ElgError::Bootstrap {
                        name: "bootstrap".to_string(),
                        message: script_message(&e),
                    })
            }
            Some(path) => {
                let name = path.display().to_string();
                let bootstrap_error = |message: String| ElgError::Bootstrap {
                    name: name.clone(),
                    message,
                };
                if !self.source.exists(path) {
                    return Err(bootstrap_error("file doesn't exist".to_string()));
                }
                let bytes = self
                    .source
                    .read(path)
                    .map_err(|e| bootstrap_error(e.to_string()))?;
                lua.load(bytes)
                    .set_name(format!("@{name}"))
                    .exec()
                    .map_err(|e| bootstrap_error(script_message(&e)))?;
                log::debug!("[elg] bootstrap {name} done");
                Ok(())
            }
        }
    }

    /// Unload every extension and drop the runtime.
    ///
    /// Teardown always completes; the first unload error is returned.
    pub fn stop(&mut self) -> Result<(), ElgError> {
        let Some(mut rt) = self.runtime.take() else {
            return Ok(());
        };
        let mut first_err = None;

        if let Some(main) = rt.main.take() {
            if let Err(err) = main.dispatch(Event::Unload, MultiValue::new(), &rt.scope.calls) {
                log::warn!("[elg] {err}");
                first_err.get_or_insert(err);
            }
        }
        for extension in rt.cache.drain() {
            if let Err(err) = extension.unload(&rt.scope.calls) {
                log::warn!("[elg] {err}");
                first_err.get_or_insert(err);
            }
            log::debug!("[elg] unloaded {}", extension.key());
        }

        if let Err(err) = rt.scope.lua.gc_collect() {
            log::warn!("[elg] final collection failed: {err}");
        }
        drop(rt);
        log::info!("[elg] runtime stopped");

        first_err.map_or(Ok(()), Err)
    }

    // ── Extensions ────────────────────────────────────────────────────────

    /// Load `name` if needed.
    pub fn load(&mut self, name: &str) -> Result<&Extension, ElgError> {
        let (source, rt) = self.parts()?;
        let (cache, ctx) = rt.split(source);
        cache.load(&ctx, name)
    }

    /// Load `name` if needed and resolve `function` in it.
    pub fn load_extension(&mut self, name: &str, function: &str) -> Result<mlua::Function, ElgError> {
        let (source, rt) = self.parts()?;
        let (cache, ctx) = rt.split(source);
        cache.load_function(&ctx, name, function)
    }

    /// Call `event_name` in extension `name` if it defines it.
    pub fn dispatch(
        &mut self,
        name: &str,
        event_name: &str,
        args: &[HostValue],
    ) -> Result<Option<HostValue>, ElgError> {
        let (source, rt) = self.parts()?;
        let (cache, ctx) = rt.split(source);
        let extension = cache.load(&ctx, name)?;
        let namespace = extension.namespace().clone();
        let key = extension.key().to_string();

        let args = rt.values(args)?;
        match call_event(&namespace, &key, event_name, args, &rt.scope.calls)? {
            Some(value) => HostValue::from_script(value, event_name).map(Some),
            None => Ok(None),
        }
    }

    /// Call `function` of extension `name` in mirror mode.
    ///
    /// Characters emitted by the call are pushed onto `output`.
    pub fn call(
        &mut self,
        name: &str,
        function: &str,
        args: &[HostValue],
        output: &mut Vec<char>,
    ) -> Result<CallOutcome, ElgError> {
        let (source, rt) = self.parts()?;
        let (cache, ctx) = rt.split(source);
        let namespace = cache.load(&ctx, name)?.namespace().clone();
        let resolved = cache.load_function(&ctx, name, function)?;

        let scope = &rt.scope;
        let outcome = mirror_call(
            &scope.lua,
            &namespace,
            &scope.local,
            &resolved,
            function,
            args,
            output,
            &scope.calls,
        )?;
        rt.count_call(name, function)?;
        Ok(outcome)
    }

    // ── Main extension ────────────────────────────────────────────────────

    /// Load the script attached to `main_graph` of `graph_file`, replacing
    /// the current main extension.
    ///
    /// `Ok(false)` when there is no graph name or no such script.
    pub fn load_main_extension(
        &mut self,
        graph_file: &Path,
        main_graph: Option<&str>,
    ) -> Result<bool, ElgError> {
        self.runtime()?;
        let Some(graph) = main_graph else {
            return Ok(false);
        };
        let path = main_extension_path(graph_file, graph, self.source.suffix());
        if !self.source.exists(&path) {
            log::debug!("[elg] no main extension at {}", path.display());
            return Ok(false);
        }

        self.unload_main_extension()?;
        let (source, rt) = self.parts()?;
        let label = path.display().to_string();
        let scope = &rt.scope;
        let (namespace, events) = prime(
            &scope.lua,
            source,
            &path,
            &label,
            &scope.lua.globals(),
            MAIN_LAYER,
            &scope.calls,
            |_| Ok(()),
        )?;
        log::info!("[elg] main extension {label} loaded");
        rt.main = Some(MainExtension {
            path,
            namespace,
            events,
        });
        Ok(true)
    }

    /// Run the main extension's `unload_event` and detach it.
    pub fn unload_main_extension(&mut self) -> Result<(), ElgError> {
        let Some(rt) = self.runtime.as_mut() else {
            return Ok(());
        };
        match rt.main.take() {
            Some(main) => main
                .dispatch(Event::Unload, MultiValue::new(), &rt.scope.calls)
                .map(|_| ()),
            None => Ok(()),
        }
    }

    pub fn has_main_extension(&self) -> bool {
        self.runtime.as_ref().is_some_and(|rt| rt.main.is_some())
    }

    /// Events the main extension implements; empty without one.
    pub fn main_events(&self) -> EventSet {
        self.runtime
            .as_ref()
            .and_then(|rt| rt.main.as_ref())
            .map(|m| m.events)
            .unwrap_or_default()
    }

    /// Dispatch `event` to the main extension.
    ///
    /// `Ok(None)` when there is no main extension or it does not implement
    /// `event`.
    pub fn dispatch_main(&self, event: Event, args: &[HostValue]) -> Result<Option<HostValue>, ElgError> {
        let rt = self.runtime()?;
        let Some(main) = &rt.main else {
            return Ok(None);
        };
        let args = rt.values(args)?;
        match main.dispatch(event, args, &rt.scope.calls)? {
            Some(value) => HostValue::from_script(value, event.name()).map(Some),
            None => Ok(None),
        }
    }

    /// Token at the cursor, after letting the main extension move it.
    pub fn token_event(&self, view: &TokenView<'_>, cursor: &mut Cursor) -> Result<i32, ElgError> {
        match self.runtime.as_ref().and_then(|rt| rt.main.as_ref().map(|m| (rt, m))) {
            Some((rt, main)) => main.token_event(view, cursor, self.config.advance_policy, &rt.scope.calls),
            None => view.token_at(cursor.index()),
        }
    }

    pub fn slide_event(&self, index: i64) -> Result<i64, ElgError> {
        match self.runtime.as_ref().and_then(|rt| rt.main.as_ref().map(|m| (rt, m))) {
            Some((rt, main)) => main.slide_event(index, &rt.scope.calls),
            None => Ok(index),
        }
    }

    // ── Engine state published to scripts ─────────────────────────────────

    pub fn set_special_constants(&self, view: &TokenView<'_>) -> Result<(), ElgError> {
        Ok(set_special_constants(&self.runtime()?.scope.lua, view)?)
    }

    pub fn set_locate_call_params(&self, params: &LocateParams) -> Result<(), ElgError> {
        Ok(set_locate_call_params(&self.runtime()?.scope.lua, params)?)
    }

    pub fn set_morpho_locate_call_params(&self, params: &MorphoLocateParams) -> Result<(), ElgError> {
        Ok(set_morpho_locate_call_params(&self.runtime()?.scope.lua, params)?)
    }

    /// Read a value scripts stored in `uEnvironment.values`.
    pub fn stored_value(&self, key: &str) -> Result<Option<HostValue>, ElgError> {
        let rt = self.runtime()?;
        let values: Table = rt.scope.environment.get(ENVIRONMENT_VALUES)?;
        match values.raw_get::<Value>(key)? {
            Value::Nil => Ok(None),
            value => HostValue::from_script(value, key).map(Some),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("[elg] error while dropping session: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdvancePolicy;
    use crate::scripting::source::MemorySource;
    use std::sync::Mutex;

    fn start(source: MemorySource) -> Session {
        let mut session = Session::new(HostConfig::default(), source)
            .with_fatal_handler(Arc::new(|err: &ElgError| panic!("fatal: {err}")));
        session.start().unwrap();
        session
    }

    /// Registers `record(s)` and returns the recorded strings.
    fn recorder(session: &Session) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let lua = session.lua().unwrap();
        let record = lua
            .create_function(move |_, s: String| {
                sink.lock().unwrap().push(s);
                Ok(())
            })
            .unwrap();
        lua.globals().set("record", record).unwrap();
        seen
    }

    fn scripts() -> MemorySource {
        MemorySource::new("scripts", ".upp")
            .with_extension(
                "a",
                r#"
                local function note(s) if record then record(s) end end
                function load_event() note("load a") end
                function unload_event() note("unload a") end
                function greet(name) return "hi " .. name end
                function keep(v) kept = v; return true end
                function drop(v) kept = v; return false end
                function peek() return kept end
                "#,
            )
            .with_extension("b", r#"function unload_event() if record then record("unload b") end end"#)
            .with_extension("c", "function f() return 1 end")
    }

    const BUFFER: [i32; 4] = [3, 0, 4, 0];

    fn view() -> TokenView<'static> {
        TokenView {
            buffer: &BUFFER,
            token_count: 5,
            space: 0,
            sentence: 1,
            stop: 2,
        }
    }

    #[test]
    fn start_publishes_the_api() {
        let session = start(scripts());
        let lua = session.lua().unwrap();
        let ok: bool = lua
            .load("return type(uEnvironment) == 'table' and type(uString.format) == 'function'")
            .eval()
            .unwrap();
        assert!(ok);
        assert!(session.local_namespace().is_some());
    }

    #[test]
    fn operations_need_a_running_session() {
        let mut session = Session::new(HostConfig::default(), scripts());
        assert!(!session.is_running());
        let err = session.call("a", "greet", &[], &mut Vec::new()).unwrap_err();
        assert!(matches!(err, ElgError::NotRunning));
    }

    #[test]
    fn call_emits_and_counts() {
        let mut session = start(scripts());
        let mut out = Vec::new();
        let outcome = session.call("a", "greet", &["bob".into()], &mut out).unwrap();
        assert_eq!(outcome, CallOutcome::Emitted(6));
        assert_eq!(out.iter().collect::<String>(), "hi bob");

        session.call("a", "greet", &["al".into()], &mut out).unwrap();
        let count: i64 = session
            .lua()
            .unwrap()
            .load("return uEnvironment.called['a.greet']")
            .eval()
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(session.loaded_extensions(), vec!["a"]);
    }

    #[test]
    fn only_accepted_calls_leave_bindings_behind() {
        let mut session = start(scripts());
        let mut out = Vec::new();
        session.call("a", "drop", &["no".into()], &mut out).unwrap();
        assert_eq!(session.call("a", "peek", &[], &mut out).unwrap(), CallOutcome::Reject);

        session.call("a", "keep", &["yes".into()], &mut out).unwrap();
        assert_eq!(session.call("a", "peek", &[], &mut out).unwrap(), CallOutcome::Emitted(3));
        assert_eq!(out.iter().collect::<String>(), "yes");
    }

    #[test]
    fn stop_unloads_every_extension_once_in_load_order() {
        let mut session = start(scripts());
        let seen = recorder(&session);
        for name in ["a", "b", "c"] {
            session.load(name).unwrap();
        }
        session.load("a").unwrap();
        session.stop().unwrap();
        session.stop().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["load a", "unload a", "unload b"]
        );
        assert!(!session.is_running());
        assert!(session.lua().is_none());
    }

    #[test]
    fn restart_forgets_everything() {
        let mut session = start(scripts());
        let _seen = recorder(&session);
        session.call("a", "keep", &["x".into()], &mut Vec::new()).unwrap();
        session.restart().unwrap();

        assert!(session.loaded_extensions().is_empty());
        assert_eq!(session.local_namespace().unwrap().raw_get::<Value>("kept").unwrap(), Value::Nil);
        assert_eq!(session.script_invocations(), 0);
        let record: Value = session.lua().unwrap().globals().get("record").unwrap();
        assert_eq!(record, Value::Nil);
    }

    #[test]
    fn unload_errors_do_not_stop_teardown() {
        let source = MemorySource::new("scripts", ".upp")
            .with_extension("bad", "function unload_event() error('stuck') end")
            .with_extension("good", r#"function unload_event() record("good") end"#);
        let mut session = start(source);
        let seen = recorder(&session);
        session.load("bad").unwrap();
        session.load("good").unwrap();

        let err = session.stop().unwrap_err();
        assert!(matches!(err, ElgError::Event { ref event, .. } if event == "unload_event"));
        assert_eq!(*seen.lock().unwrap(), vec!["good"]);
        assert!(!session.is_running());
    }

    #[test]
    fn generic_dispatch_calls_named_events() {
        let source = MemorySource::new("scripts", ".upp")
            .with_extension("ev", "function on_flush(n) return n * 2 end");
        let mut session = start(source);
        let out = session.dispatch("ev", "on_flush", &[21.into()]).unwrap();
        assert_eq!(out, Some(HostValue::Integer(42)));
        assert_eq!(session.dispatch("ev", "on_missing", &[]).unwrap(), None);
    }

    #[test]
    fn main_extension_is_found_next_to_the_graph() {
        let source = scripts().with_file(
            "graphs/Main.upp",
            r#"
            function load_event() record_main = true end
            function token_event(i) return i end
            function slide_event(i) return i + 1 end
            "#,
        );
        let mut session = start(source);
        let graph = Path::new("graphs/Main.fst2");

        assert!(!session.load_main_extension(graph, None).unwrap());
        assert!(!session.load_main_extension(graph, Some("Other")).unwrap());
        assert!(session.load_main_extension(graph, Some("Main\u{1}dbg")).unwrap());

        assert!(session.has_main_extension());
        assert!(session.main_events().implements(Event::Token));
        assert!(!session.main_events().implements(Event::Unload));
        assert_eq!(session.slide_event(4).unwrap(), 5);
        assert!(session.loaded_extensions().is_empty(), "main is not cached");

        let mut cursor = Cursor::new(2, 0);
        assert_eq!(session.token_event(&view(), &mut cursor).unwrap(), 4);

        session.unload_main_extension().unwrap();
        assert!(!session.has_main_extension());
    }

    #[test]
    fn token_event_without_handler_makes_no_script_call() {
        let source = scripts().with_file("g/Plain.upp", "x = 1");
        let mut session = start(source);
        session.load_main_extension(Path::new("g/Plain.fst2"), Some("Plain")).unwrap();

        let before = session.script_invocations();
        let mut cursor = Cursor::new(1, 1);
        assert_eq!(session.token_event(&view(), &mut cursor).unwrap(), 4);
        assert_eq!(session.slide_event(3).unwrap(), 3);
        assert_eq!(session.script_invocations(), before);
    }

    #[test]
    fn dispatch_main_enforces_arity() {
        let source = scripts().with_file("g/M.upp", "function slide_event(i) return i end");
        let mut session = start(source);
        session.load_main_extension(Path::new("g/M.fst2"), Some("M")).unwrap();
        let err = session.dispatch_main(Event::Slide, &[]).unwrap_err();
        assert!(matches!(err, ElgError::Arity { .. }));
        assert_eq!(
            session.dispatch_main(Event::Slide, &[7.into()]).unwrap(),
            Some(HostValue::Integer(7))
        );
        assert_eq!(session.dispatch_main(Event::Token, &[7.into()]).unwrap(), None);
    }

    #[test]
    fn rejecting_policy_surfaces_bad_advances() {
        let source = scripts().with_file("g/M.upp", "function token_event(i) return 99 end");
        let config = HostConfig {
            advance_policy: AdvancePolicy::Reject,
            ..HostConfig::default()
        };
        let mut session = Session::new(config, source);
        session.start().unwrap();
        session.load_main_extension(Path::new("g/M.fst2"), Some("M")).unwrap();
        let err = session.token_event(&view(), &mut Cursor::default()).unwrap_err();
        assert!(matches!(err, ElgError::AdvanceOutOfBounds { index: 99, .. }));
    }

    #[test]
    fn configured_bootstrap_runs_before_the_api() {
        let source = scripts().with_file("boot.lua", "booted = uEnvironment == nil");
        let config = HostConfig {
            bootstrap: Some("boot.lua".into()),
            ..HostConfig::default()
        };
        let mut session = Session::new(config.clone(), source);
        session.start().unwrap();
        let booted: bool = session.lua().unwrap().globals().get("booted").unwrap();
        assert!(booted);

        let mut missing = Session::new(config, MemorySource::default());
        assert!(matches!(missing.start().unwrap_err(), ElgError::Bootstrap { .. }));
    }

    #[test]
    fn require_cannot_reach_extension_scripts() {
        let dir = std::env::temp_dir().join(format!("elg-require-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("dates.upp"), "function year() return 2024 end").unwrap();
        std::fs::write(
            dir.join("user.upp"),
            "found, err = pcall(require, 'dates')",
        )
        .unwrap();

        let config = HostConfig {
            script_dir: dir.clone(),
            ..HostConfig::default()
        };
        let mut session = Session::from_config(config);
        session.start().unwrap();
        let lua = session.lua().unwrap();
        let path: String = lua.load("return package.path").eval().unwrap();
        assert!(path.contains("?.lua"));
        assert!(!path.contains("?.upp"));

        let user = session.load("user").unwrap().namespace().clone();
        let found: bool = user.raw_get("found").unwrap();
        assert!(!found, "extension scripts are not modules");
        let lua = session.lua().unwrap();
        assert_eq!(lua.globals().raw_get::<Value>("year").unwrap(), Value::Nil);
        assert_eq!(session.loaded_extensions(), vec!["user"]);

        session.stop().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn main_extension_sees_globals_not_the_local_layer() {
        let source = scripts().with_file(
            "g/M.upp",
            "function slide_event(i) if kept ~= nil then return -1 end return i end",
        );
        let mut session = start(source);
        session.call("a", "keep", &["x".into()], &mut Vec::new()).unwrap();
        assert!(session.local_namespace().unwrap().contains_key("kept").unwrap());

        session.load_main_extension(Path::new("g/M.fst2"), Some("M")).unwrap();
        assert_eq!(session.slide_event(4).unwrap(), 4);
        assert_eq!(
            session.dispatch_main(Event::Slide, &[1.into()]).unwrap(),
            Some(HostValue::Integer(1))
        );
    }

    #[test]
    fn fatal_hands_errors_to_the_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let session = Session::new(HostConfig::default(), scripts())
            .with_fatal_handler(Arc::new(move |err: &ElgError| sink.lock().unwrap().push(err.to_string())));
        session.fatal(&ElgError::NotRunning);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn stored_values_are_readable_from_the_host() {
        let source = MemorySource::new("s", ".upp").with_extension("v", "uEnvironment.values.total = 3");
        let mut session = start(source);
        session.load("v").unwrap();
        assert_eq!(session.stored_value("total").unwrap(), Some(HostValue::Integer(3)));
        assert_eq!(session.stored_value("absent").unwrap(), None);
    }
}
