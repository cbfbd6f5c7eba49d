//! QuickJS-backed policy engine.
//!
//! Rule modules are JavaScript. A module defines the queries it answers as
//! global functions taking `(input, data)`, or as plain global values:
//!
//! ```js
//! function read_access(input, data) {
//!     if (input.uid === "abc" && input.resource === "agents") {
//!         return ["first_name", "read_only", "user"];
//!     }
//!     return [];
//! }
//! ```
//!
//! # Design
//!
//! Each compiled query owns a **pool of runtimes**. Compilation loads the
//! reference data (as the global `data`) and the module into every runtime
//! once; evaluation only injects the input and calls the query.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ QuickJsQuery (one per query per refresh cycle)   │
//! │   ├── instances: Vec<Mutex<QuickJsInstance>>     │
//! │   │     └── data + module already evaluated      │
//! │   └── counter: AtomicUsize (round-robin)         │
//! └──────────────────────────────────────────────────┘
//!              │
//!              ▼ evaluate(input)
//! ┌──────────────────────────────────────────────────┐
//! │ Per-request:                                     │
//! │   1. Pick instance (round-robin), lock it        │
//! │   2. Arm interrupt handler for the timeout       │
//! │   3. Call query(input, data), JSON-encode result │
//! │   4. Disarm interrupt handler                    │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! An undefined query or an `undefined` result produces zero result-sets.
//! `console.log/warn/error` are mapped to tracing.
//!
//! # Isolation
//!
//! Runtimes are reused across requests, so after the module has loaded the
//! whole global object graph is deep-frozen, `data` included, and every
//! `input` is frozen before the call. Writes to globals, to `data` or to
//! `input` are silently ignored in sloppy mode and throw in strict mode.
//! Top-level `let`/`const` bindings are not properties of the global object
//! and stay mutable; modules must not keep request state in them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rquickjs::{Context, Ctx, Function, Object, Runtime};

use crate::DataMap;
use crate::access::AccessInput;
use crate::config::QuickJsConfig;
use crate::engine::{CompiledQuery, PolicyEngine, QueryName, ResultSet};
use crate::error::EngineError;

/// Installs `__fieldgate_freeze`, a deep freeze that walks own data
/// properties and prototypes. The builtins it uses are captured before the
/// module runs, so the module cannot swap them out.
const FREEZE_PRELUDE: &str = r#"
const __fieldgate_freeze = (() => {
    const freeze = Object.freeze;
    const isFrozen = Object.isFrozen;
    const describe = Object.getOwnPropertyDescriptor;
    const protoOf = Object.getPrototypeOf;
    const ownKeys = Reflect.ownKeys;
    return function (root) {
        const pending = [root];
        while (pending.length > 0) {
            const value = pending.pop();
            if (value === null || (typeof value !== "object" && typeof value !== "function")) {
                continue;
            }
            if (isFrozen(value)) {
                continue;
            }
            try {
                freeze(value);
            } catch (e) {
                // Typed arrays with elements cannot be frozen.
                continue;
            }
            for (const key of ownKeys(value)) {
                const desc = describe(value, key);
                if (desc !== undefined && "value" in desc) {
                    pending.push(desc.value);
                }
            }
            pending.push(protoOf(value));
        }
        return root;
    };
})();
"#;

// =============================================================================
// Engine
// =============================================================================

/// Policy engine evaluating JavaScript rule modules with QuickJS.
#[derive(Debug, Clone, Default)]
pub struct QuickJsEngine {
    config: QuickJsConfig,
}

impl QuickJsEngine {
    /// Create an engine with the given runtime limits.
    #[must_use]
    pub fn new(config: QuickJsConfig) -> Self {
        Self { config }
    }

    /// Compile into the concrete query type.
    ///
    /// # Errors
    ///
    /// Returns an error if a runtime cannot be created or the module fails
    /// to load.
    pub fn compile_query(
        &self,
        data: &DataMap,
        module: &str,
        query: QueryName,
    ) -> Result<QuickJsQuery, EngineError> {
        let data_json = serde_json::to_string(data)
            .map_err(|e| EngineError::compile(query.as_str(), e.to_string()))?;

        let pool_size = self.config.pool_size.max(1);
        let mut instances = Vec::with_capacity(pool_size);

        for _ in 0..pool_size {
            let instance = QuickJsInstance::new(&self.config)?;
            instance
                .load(&data_json, module, self.config.timeout_ms)
                .map_err(|e| match e {
                    RunError::Timeout => {
                        EngineError::compile(query.as_str(), "module evaluation timed out")
                    }
                    RunError::Script(message) => EngineError::compile(query.as_str(), message),
                })?;
            instances.push(Mutex::new(instance));
        }

        tracing::debug!(query = %query, pool_size, "Compiled QuickJS query");

        Ok(QuickJsQuery {
            query,
            instances,
            timeout_ms: self.config.timeout_ms,
            counter: AtomicUsize::new(0),
        })
    }
}

impl PolicyEngine for QuickJsEngine {
    fn compile(
        &self,
        data: &DataMap,
        module: &str,
        query: QueryName,
    ) -> Result<Arc<dyn CompiledQuery>, EngineError> {
        Ok(Arc::new(self.compile_query(data, module, query)?))
    }
}

// =============================================================================
// Compiled Query
// =============================================================================

/// A query compiled into a pool of QuickJS runtimes.
pub struct QuickJsQuery {
    query: QueryName,
    instances: Vec<Mutex<QuickJsInstance>>,
    timeout_ms: u64,
    counter: AtomicUsize,
}

impl QuickJsQuery {
    /// Pool statistics.
    #[must_use]
    pub fn stats(&self) -> QuickJsStats {
        QuickJsStats {
            pool_size: self.instances.len(),
            evaluations: self.counter.load(Ordering::Relaxed),
        }
    }

    fn call_script(&self, input_json: &str) -> String {
        let name = self.query.as_str();
        format!(
            r#"
(function() {{
    if (typeof {name} === "undefined") return undefined;
    const input = __fieldgate_freeze({input_json});
    const value = typeof {name} === "function" ? {name}(input, data) : {name};
    return value === undefined ? undefined : JSON.stringify(value);
}})()
"#
        )
    }
}

impl CompiledQuery for QuickJsQuery {
    fn evaluate(&self, input: &AccessInput) -> Result<Vec<ResultSet>, EngineError> {
        let input_json =
            serde_json::to_string(input).map_err(|e| EngineError::Evaluation(e.to_string()))?;
        let script = self.call_script(&input_json);

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % self.instances.len();
        let instance = match self.instances[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("QuickJS instance mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        };

        let raw = instance
            .run(self.timeout_ms, |ctx| {
                ctx.eval::<Option<String>, _>(script.as_bytes())
            })
            .map_err(|e| match e {
                RunError::Timeout => EngineError::Timeout,
                RunError::Script(message) => EngineError::Evaluation(message),
            })?;

        let Some(json) = raw else {
            return Ok(Vec::new());
        };

        let value = serde_json::from_str(&json)
            .map_err(|e| EngineError::Evaluation(format!("invalid query result: {e}")))?;
        Ok(vec![ResultSet::single(value)])
    }
}

/// Statistics about a compiled query's runtime pool.
#[derive(Debug, Clone)]
pub struct QuickJsStats {
    /// Number of runtime instances in the pool.
    pub pool_size: usize,

    /// Total number of evaluations performed.
    pub evaluations: usize,
}

// =============================================================================
// Runtime Instance
// =============================================================================

/// Individual QuickJS runtime with its persistent context.
struct QuickJsInstance {
    runtime: Runtime,
    context: Context,
}

enum RunError {
    Timeout,
    Script(String),
}

impl QuickJsInstance {
    fn new(config: &QuickJsConfig) -> Result<Self, EngineError> {
        let runtime = Runtime::new().map_err(|e| EngineError::Init(e.to_string()))?;
        runtime.set_memory_limit(config.memory_limit_mb * 1024 * 1024);
        runtime.set_max_stack_size(config.max_stack_size_kb * 1024);

        let context = Context::full(&runtime).map_err(|e| EngineError::Init(e.to_string()))?;

        Ok(Self { runtime, context })
    }

    /// Bind `data`, evaluate the module in the global scope, then freeze
    /// every global so no evaluation can leave state for the next one.
    fn load(&self, data_json: &str, module: &str, timeout_ms: u64) -> Result<(), RunError> {
        let data_script = format!("var data = {data_json};");
        self.run(timeout_ms, |ctx| {
            setup_console(ctx)?;
            ctx.eval::<(), _>(FREEZE_PRELUDE.as_bytes())?;
            ctx.eval::<(), _>(data_script.as_bytes())?;
            ctx.eval::<(), _>(module.as_bytes())?;
            ctx.eval::<(), _>("__fieldgate_freeze(globalThis);".as_bytes())
        })
    }

    /// Run `f` in this instance's context with an execution deadline.
    fn run<R>(
        &self,
        timeout_ms: u64,
        f: impl FnOnce(&Ctx<'_>) -> rquickjs::Result<R>,
    ) -> Result<R, RunError> {
        let start = Instant::now();
        let timed_out = Arc::new(AtomicBool::new(false));
        let flag = timed_out.clone();

        self.runtime
            .set_interrupt_handler(Some(Box::new(move || {
                let expired = start.elapsed().as_millis() > u128::from(timeout_ms);
                if expired {
                    flag.store(true, Ordering::Relaxed);
                }
                expired
            })));

        let result = self
            .context
            .with(|ctx| f(&ctx).map_err(|e| describe_error(&ctx, e)));

        self.runtime.set_interrupt_handler(None);

        match result {
            Ok(value) => Ok(value),
            Err(_) if timed_out.load(Ordering::Relaxed) => Err(RunError::Timeout),
            Err(message) => Err(RunError::Script(message)),
        }
    }
}

/// Turn a QuickJS error into a readable message, unpacking thrown exceptions.
fn describe_error(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !error.is_exception() {
        return error.to_string();
    }

    let caught = ctx.catch();
    match caught.as_exception() {
        Some(exception) => exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string()),
        None => format!("uncaught exception: {caught:?}"),
    }
}

/// Install console.log/warn/error mapped to tracing.
fn setup_console(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let console = Object::new(ctx.clone())?;

    console.set(
        "log",
        Function::new(ctx.clone(), |msg: String| {
            tracing::debug!(target: "quickjs", message = %msg, "console.log");
        })?,
    )?;

    console.set(
        "warn",
        Function::new(ctx.clone(), |msg: String| {
            tracing::warn!(target: "quickjs", message = %msg, "console.warn");
        })?,
    )?;

    console.set(
        "error",
        Function::new(ctx.clone(), |msg: String| {
            tracing::error!(target: "quickjs", message = %msg, "console.error");
        })?,
    )?;

    globals.set("console", console)?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
