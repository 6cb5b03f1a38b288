//! Runtime contexts: one interpreter plus its bound capabilities.
//!
//! A [`RuntimeContext`] owns a Rhai [`Engine`], the global [`Scope`], and
//! the functions of every program loaded so far. The [`ScriptCache`] and
//! the [`FetchService`] are shared with every context copied from it.
//!
//! One context runs one script call at a time. Concurrent invocations each
//! get their own [`RuntimeContext::copy`] on their own thread.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rhai::{AST, Array, CallFnOptions, Dynamic, Engine, FnPtr, Map, Scope};
use tracing::{debug, info};

use capsule_common::{RuntimeConfig, RuntimeError};
use capsule_core::{CacheLookup, DurableEntry, ScriptCache, ScriptOrigin, Sink};
use capsule_host::{FetchService, HostState, build_engine, validate};

use crate::program;

/// Source name given to code passed to [`RuntimeContext::run`].
pub const INLINE_SOURCE: &str = "<inline>";

/// An isolated interpreter instance with the capability surface installed.
pub struct RuntimeContext {
    /// Interpreter with handlers bound to `host`.
    engine: Engine,

    /// Top-level variables.
    scope: Scope<'static>,

    /// Functions of everything loaded so far (no statements).
    program: AST,

    /// State the capability handlers close over.
    host: Arc<HostState>,

    /// Registry base URL.
    registry_url: String,

    /// Access token for registry requests.
    token: Option<String>,

    /// Consult the cache on load.
    cache_enabled: bool,
}

impl RuntimeContext {
    /// Create a root context, with the cache at the configured location.
    pub fn new(config: &RuntimeConfig) -> Result<Self, RuntimeError> {
        let cache = Arc::new(ScriptCache::new(config.cache_dir()?));
        Self::with_cache(config, cache)
    }

    /// Create a root context using an existing cache.
    pub fn with_cache(config: &RuntimeConfig, cache: Arc<ScriptCache>) -> Result<Self, RuntimeError> {
        let fetch = FetchService::new(&config.http, cache)?;
        let host = Arc::new(HostState::new(
            fetch,
            Sink::stdout(),
            Sink::stderr(),
            config.verbose,
        ));

        info!(
            registry = %config.registry.base_url,
            cache_dir = %host.fetch().cache().dir().display(),
            cache_enabled = config.cache.enabled,
            "Runtime context created"
        );

        Ok(Self::from_host(
            host,
            Scope::new(),
            AST::empty(),
            config.registry.base_url.clone(),
            config.registry.access_token.clone(),
            config.cache.enabled,
        ))
    }

    fn from_host(
        host: Arc<HostState>,
        scope: Scope<'static>,
        program: AST,
        registry_url: String,
        token: Option<String>,
        cache_enabled: bool,
    ) -> Self {
        Self {
            engine: build_engine(&host),
            scope,
            program,
            host,
            registry_url,
            token,
            cache_enabled,
        }
    }

    /// Produce an independent context.
    ///
    /// The copy shares the cache and HTTP client, inherits token, verbosity,
    /// and output sinks, and starts from a snapshot of this context's
    /// globals. Its capability handlers are bound to a new host state.
    ///
    /// Globals captured by closures are copied into new cells, so writes
    /// through the copy never reach this context or its other copies.
    pub fn copy(&self) -> Self {
        let host = Arc::new(HostState::new(
            self.host.fetch().clone(),
            self.host.stdout(),
            self.host.stderr(),
            self.host.verbose(),
        ));

        Self::from_host(
            host,
            self.detached_scope(),
            self.program.clone(),
            self.registry_url.clone(),
            self.token.clone(),
            self.cache_enabled,
        )
    }

    /// A copy of the globals that shares no cells with `self.scope`.
    ///
    /// Each shared top-level variable gets a new cell. Closures anywhere in
    /// the copied values are re-pointed at those cells by captured name; a
    /// closure's captured variables are its leading parameters.
    fn detached_scope(&self) -> Scope<'static> {
        let entries: Vec<(String, bool, Dynamic)> = self
            .scope
            .iter_raw()
            .map(|(name, constant, value)| (name.to_string(), constant, value.clone()))
            .collect();

        // Later entries shadow earlier ones, so the last cell per name wins.
        let mut cells = HashMap::new();
        let slots: Vec<Option<Dynamic>> = entries
            .iter()
            .map(|(name, _, value)| {
                value.is_shared().then(|| {
                    let cell = Dynamic::UNIT.into_shared();
                    cells.insert(name.clone(), cell.clone());
                    cell
                })
            })
            .collect();

        let detacher = Detacher {
            cells,
            captures: self
                .program
                .iter_functions()
                .map(|f| (f.name.to_string(), f.params.iter().map(ToString::to_string).collect()))
                .collect(),
        };

        let mut scope = Scope::new();
        for ((name, constant, value), slot) in entries.into_iter().zip(slots) {
            let value = match slot {
                Some(mut cell) => {
                    let inner = detacher.detach(&value.flatten_clone());
                    if let Some(mut guard) = cell.write_lock::<Dynamic>() {
                        *guard = inner;
                    }
                    cell
                }
                None => detacher.detach(&value),
            };
            if constant {
                scope.push_constant_dynamic(name, value);
            } else {
                scope.push_dynamic(name, value);
            }
        }
        scope
    }

    /// Load a program by name or URL and execute it in this context.
    ///
    /// The compiled-script tier, then the on-disk tier, then the network are
    /// tried in order. A cached program that fails to compile or run falls
    /// through to the next tier. A network or registry failure is final.
    pub fn load(&mut self, name_or_url: &str) -> Result<(), RuntimeError> {
        let url = program::resolve(&self.registry_url, name_or_url, self.token.as_deref())?;

        let lookup = if self.cache_enabled {
            self.cache().get_cached_script(&url)
        } else {
            CacheLookup::Miss
        };

        match lookup {
            CacheLookup::Script(ast) => match self.execute(&ast) {
                Ok(_) => {
                    debug!(url = %url, "Loaded compiled program from cache");
                    return Ok(());
                }
                Err(e) => debug!(url = %url, error = %e, "Cached program failed"),
            },
            CacheLookup::Durable(entry) if !entry.body.is_empty() => {
                match self.load_stored(&url, &entry) {
                    Ok(()) => {
                        debug!(url = %url, "Loaded program from disk cache");
                        return Ok(());
                    }
                    Err(e) => debug!(url = %url, error = %e, "Stored program failed"),
                }
            }
            CacheLookup::Durable(_) | CacheLookup::Miss => {}
        }

        info!(url = %url, "Fetching program");
        let response = self.host.fetch().get(&url)?;
        validate(&response).map_err(|source| RuntimeError::Registry {
            program: name_or_url.to_string(),
            source,
        })?;

        let ast = self.compile(&url, &response.text())?;
        self.execute(&ast)?;

        if self.cache_enabled {
            let origin = ScriptOrigin::Fetched {
                body: &response.body,
                meta: &response.meta(),
            };
            if let Err(e) = self.cache().cache_script(&url, ast, origin) {
                debug!(url = %url, error = %e, "Failed to cache program");
            }
        }

        Ok(())
    }

    fn load_stored(&mut self, url: &str, entry: &DurableEntry) -> Result<(), RuntimeError> {
        let ast = self.compile(url, &String::from_utf8_lossy(&entry.body))?;
        self.execute(&ast)?;
        if let Err(e) = self
            .cache()
            .cache_script(url, ast, ScriptOrigin::Stored(entry))
        {
            debug!(url = %url, error = %e, "Failed to cache program");
        }
        Ok(())
    }

    /// Compile and execute source text, returning its value.
    pub fn run(&mut self, source: &str) -> Result<Dynamic, RuntimeError> {
        let ast = self.compile(INLINE_SOURCE, source)?;
        self.execute(&ast)
    }

    /// Compile and execute a local script file.
    pub fn run_file(&mut self, path: &Path) -> Result<Dynamic, RuntimeError> {
        let source = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Running script file");
        let ast = self.compile(&path.display().to_string(), &source)?;
        self.execute(&ast)
    }

    /// Invoke a global function by name.
    pub fn call(&mut self, name: &str, args: Vec<Dynamic>) -> Result<Dynamic, RuntimeError> {
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut self.scope, &self.program, name, args)
            .map_err(|e| RuntimeError::execution(e.to_string()))
    }

    /// Names of all global functions and variables, sorted.
    pub fn globals(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions()
            .into_iter()
            .map(|(name, _)| name)
            .chain(self.scope.iter().map(|(name, _, _)| name.to_string()))
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Named global functions and their parameter counts, sorted by name.
    pub fn functions(&self) -> Vec<(String, usize)> {
        let mut functions: Vec<(String, usize)> = self
            .program
            .iter_functions()
            .filter(|f| !f.name.starts_with("anon$"))
            .map(|f| (f.name.to_string(), f.params.len()))
            .collect();
        functions.sort();
        functions.dedup();
        functions
    }

    /// Value of a global variable.
    pub fn get(&self, name: &str) -> Option<Dynamic> {
        self.scope.get_value::<Dynamic>(name)
    }

    /// Set a global variable.
    pub fn set(&mut self, name: &str, value: Dynamic) {
        self.scope.set_or_push(name.to_string(), value);
    }

    /// The cache shared by this context and its copies.
    pub fn cache(&self) -> &Arc<ScriptCache> {
        self.host.fetch().cache()
    }

    /// The HTTP capability.
    pub fn fetch(&self) -> &FetchService {
        self.host.fetch()
    }

    /// Host state the capabilities are bound to.
    pub fn host(&self) -> &Arc<HostState> {
        &self.host
    }

    /// Registry base URL.
    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    /// Access token used for registry requests.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Set or clear the access token.
    pub fn set_token(&mut self, token: Option<String>) {
        self.token = token.filter(|t| !t.is_empty());
    }

    /// Whether `debug` output is shown.
    pub fn verbose(&self) -> bool {
        self.host.verbose()
    }

    /// Toggle `debug` output.
    pub fn set_verbose(&self, verbose: bool) {
        self.host.set_verbose(verbose);
    }

    /// Replace the standard output sink, returning the previous one.
    pub fn set_stdout(&self, sink: Sink) -> Sink {
        self.host.set_stdout(sink)
    }

    /// Replace the standard error sink, returning the previous one.
    pub fn set_stderr(&self, sink: Sink) -> Sink {
        self.host.set_stderr(sink)
    }

    /// Whether loads consult the cache.
    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    fn compile(&self, name: &str, source: &str) -> Result<AST, RuntimeError> {
        let mut ast = self
            .engine
            .compile(source)
            .map_err(|e| RuntimeError::compilation(name, e.to_string()))?;
        ast.set_source(name);
        Ok(ast)
    }

    /// Run `ast` against this context's globals and keep its functions.
    fn execute(&mut self, ast: &AST) -> Result<Dynamic, RuntimeError> {
        let merged = self.program.merge(ast);
        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &merged)
            .map_err(|e| RuntimeError::execution(e.to_string()))?;
        self.program += ast.clone_functions_only();
        Ok(value)
    }
}

/// Rebuilds values so closures point at a copied set of global cells.
struct Detacher {
    /// New cell for each shared global, by name.
    cells: HashMap<String, Dynamic>,
    /// Parameter names of every script function, by function name.
    captures: HashMap<String, Vec<String>>,
}

impl Detacher {
    fn detach(&self, value: &Dynamic) -> Dynamic {
        if value.is_shared() {
            let flat = value.flatten_clone();
            // Still shared: the cell is locked elsewhere.
            if flat.is_shared() {
                return flat;
            }
            return self.detach(&flat).into_shared();
        }

        if value.is_fnptr() {
            return Dynamic::from(self.detach_closure(value.clone().cast::<FnPtr>()));
        }
        if value.is_array() {
            let array = value.clone().cast::<Array>();
            return Dynamic::from_array(array.iter().map(|v| self.detach(v)).collect());
        }
        if value.is_map() {
            let map = value.clone().cast::<Map>();
            return Dynamic::from_map(map.iter().map(|(k, v)| (k.clone(), self.detach(v))).collect());
        }
        value.clone()
    }

    fn detach_closure(&self, mut fn_ptr: FnPtr) -> FnPtr {
        let names = if fn_ptr.is_anonymous() {
            self.captures.get(fn_ptr.fn_name()).cloned().unwrap_or_default()
        } else {
            Vec::new()
        };

        for (index, arg) in fn_ptr.iter_curry_mut().enumerate() {
            let cell = names.get(index).and_then(|name| self.cells.get(name));
            *arg = match cell {
                Some(cell) if arg.is_shared() => cell.clone(),
                _ => self.detach(arg),
            };
        }
        fn_ptr
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("registry_url", &self.registry_url)
            .field("has_token", &self.token.is_some())
            .field("cache_enabled", &self.cache_enabled)
            .field("globals", &self.globals())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_core::SharedBuffer;

    fn context() -> (RuntimeContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig {
            home: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let ctx = RuntimeContext::new(&config).unwrap();
        ctx.set_stdout(Sink::null());
        ctx.set_stderr(Sink::null());
        (ctx, dir)
    }

    #[test]
    fn test_run_and_call() {
        let (mut ctx, _dir) = context();

        ctx.run("fn add(a, b) { a + b } let base = 40;").unwrap();

        let sum = ctx.call("add", vec![Dynamic::from(1_i64), Dynamic::from(2_i64)]).unwrap();
        assert_eq!(sum.as_int().unwrap(), 3);
        assert_eq!(ctx.get("base").unwrap().as_int().unwrap(), 40);
        assert_eq!(ctx.run("add(base, 2)").unwrap().as_int().unwrap(), 42);
    }

    #[test]
    fn test_functions_accumulate_across_runs() {
        let (mut ctx, _dir) = context();

        ctx.run("fn one() { 1 }").unwrap();
        ctx.run("fn two() { one() + 1 }").unwrap();

        assert_eq!(ctx.call("two", Vec::new()).unwrap().as_int().unwrap(), 2);
        assert_eq!(ctx.functions(), vec![("one".to_string(), 0), ("two".to_string(), 0)]);
    }

    #[test]
    fn test_globals_sorted() {
        let (mut ctx, _dir) = context();

        ctx.run("let zeta = 1; fn alpha(x) { x } let f = |x| x + 1;").unwrap();

        assert_eq!(ctx.globals(), vec!["alpha", "f", "zeta"]);
        assert!(ctx.get("missing").is_none());
    }

    #[test]
    fn test_errors() {
        let (mut ctx, _dir) = context();

        assert!(matches!(ctx.run("let = ;"), Err(RuntimeError::Compilation { .. })));
        assert!(matches!(ctx.run(r#"throw "boom";"#), Err(RuntimeError::Execution { .. })));
        assert!(matches!(ctx.call("nope", Vec::new()), Err(RuntimeError::Execution { .. })));
        assert!(matches!(ctx.load("-bad-"), Err(RuntimeError::InvalidProgram { .. })));
    }

    #[test]
    fn test_copy_isolation() {
        let (mut root, _dir) = context();
        root.run("let counter = 1;").unwrap();

        let mut first = root.copy();
        let second = root.copy();
        first.run("counter = 99; let extra = true;").unwrap();

        assert_eq!(first.get("counter").unwrap().as_int().unwrap(), 99);
        assert_eq!(second.get("counter").unwrap().as_int().unwrap(), 1);
        assert_eq!(root.get("counter").unwrap().as_int().unwrap(), 1);
        assert!(root.get("extra").is_none());
        assert!(Arc::ptr_eq(root.cache(), first.cache()));
    }

    #[test]
    fn test_copy_isolation_with_captured_global() {
        let (mut root, _dir) = context();
        root.run("let counter = 1; let bump = || { counter += 1; counter };")
            .unwrap();

        let mut first = root.copy();
        let mut second = root.copy();
        first.run("counter = 99;").unwrap();

        assert_eq!(first.get("counter").unwrap().as_int().unwrap(), 99);
        assert_eq!(second.get("counter").unwrap().as_int().unwrap(), 1);
        assert_eq!(root.get("counter").unwrap().as_int().unwrap(), 1);

        // The copied closure writes to the copy's own cell.
        assert_eq!(first.run("bump.call()").unwrap().as_int().unwrap(), 100);
        assert_eq!(second.run("bump.call()").unwrap().as_int().unwrap(), 2);
        assert_eq!(first.get("counter").unwrap().as_int().unwrap(), 100);
        assert_eq!(second.get("counter").unwrap().as_int().unwrap(), 2);
        assert_eq!(root.get("counter").unwrap().as_int().unwrap(), 1);

        assert_eq!(root.run("bump.call()").unwrap().as_int().unwrap(), 2);
        assert_eq!(first.get("counter").unwrap().as_int().unwrap(), 100);
    }

    #[test]
    fn test_copy_closures_in_collections() {
        let (mut root, _dir) = context();
        root.run(
            r#"
            let total = 0;
            let hooks = [|| { total += 1; }];
            let table = #{ add: |n| { total += n; } };
            "#,
        )
        .unwrap();

        let mut copy = root.copy();
        copy.run("hooks[0].call(); table.add.call(10);").unwrap();

        assert_eq!(copy.get("total").unwrap().as_int().unwrap(), 11);
        assert_eq!(root.get("total").unwrap().as_int().unwrap(), 0);
    }

    #[test]
    fn test_copies_with_captured_global_on_threads() {
        let (mut root, _dir) = context();
        root.run("let counter = 0; let bump = || { counter += 1; counter };")
            .unwrap();

        let handles: Vec<_> = (1..=8_i64)
            .map(|n| {
                let mut ctx = root.copy();
                std::thread::spawn(move || {
                    for _ in 0..n * 50 {
                        ctx.run("bump.call();").unwrap();
                    }
                    ctx.get("counter").unwrap().as_int().unwrap()
                })
            })
            .collect();

        let counters: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(counters, (1..=8).map(|n| n * 50).collect::<Vec<_>>());
        assert_eq!(root.get("counter").unwrap().as_int().unwrap(), 0);
    }

    #[test]
    fn test_copy_rebinds_output() {
        let (root, _dir) = context();
        let mut copy = root.copy();
        let root_out = SharedBuffer::new();
        let copy_out = SharedBuffer::new();
        root.set_stdout(Sink::new(root_out.clone()));
        copy.set_stdout(Sink::new(copy_out.clone()));

        copy.run(r#"print("from copy");"#).unwrap();

        assert_eq!(copy_out.contents(), "from copy\n");
        assert!(root_out.is_empty());
    }

    #[test]
    fn test_copy_inherits_token_and_verbosity() {
        let (mut root, _dir) = context();
        root.set_token(Some("tok".into()));
        root.set_verbose(true);

        let copy = root.copy();
        assert_eq!(copy.token(), Some("tok"));
        assert!(copy.verbose());

        root.set_token(Some(String::new()));
        assert_eq!(root.token(), None);
    }

    #[test]
    fn test_run_file() {
        let (mut ctx, dir) = context();
        let path = dir.path().join("lib.rhai");
        std::fs::write(&path, "fn greet(name) { `hello ${name}` }").unwrap();

        ctx.run_file(&path).unwrap();
        let greeting = ctx.call("greet", vec![Dynamic::from("capsule")]).unwrap();
        assert_eq!(greeting.into_string().unwrap(), "hello capsule");

        assert!(matches!(
            ctx.run_file(&dir.path().join("missing.rhai")),
            Err(RuntimeError::Io(_))
        ));
    }
}
