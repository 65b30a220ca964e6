use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use rquickjs::{Context, Ctx, Error as JsError, Function, IntoJs, Runtime, Value};
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::{spawn_worker, ExecutionUnit, SandboxRuntime, ScriptEngine};
use crate::dom::Handle;
use crate::js::channel::SandboxEndpoint;
use crate::js::error::{BridgeError, BridgeResult};
use crate::js::protocol::Call;

/// Sandbox kind running scripts in QuickJS on a dedicated thread.
#[derive(Debug, Clone, Default)]
pub struct QuickJsRuntime {
    memory_limit: Option<usize>,
}

impl QuickJsRuntime {
    pub const NAME: &'static str = "quickjs";

    pub fn with_memory_limit(limit: usize) -> Self {
        Self {
            memory_limit: Some(limit),
        }
    }
}

impl SandboxRuntime for QuickJsRuntime {
    fn spawn(&self, label: &str, endpoint: SandboxEndpoint) -> BridgeResult<ExecutionUnit> {
        let memory_limit = self.memory_limit;
        spawn_worker(label, endpoint, move |endpoint| {
            QuickJsSandbox::new(endpoint, memory_limit).map_err(|err| format!("{err:#}"))
        })
    }
}

/// QuickJS runtime and context living on the sandbox thread.
///
/// The context exposes a browser-shaped `document`, `location`, `alert` and
/// `parent` whose every access is a blocking call through the channel.
pub struct QuickJsSandbox {
    runtime: Runtime,
    context: Context,
}

impl QuickJsSandbox {
    pub fn new(endpoint: Rc<SandboxEndpoint>, memory_limit: Option<usize>) -> Result<Self> {
        let runtime = Runtime::new().context("failed to create QuickJS runtime")?;
        if let Some(limit) = memory_limit {
            runtime.set_memory_limit(limit);
        }
        let buffers = Arc::clone(endpoint.buffers());
        runtime.set_interrupt_handler(Some(Box::new(move || buffers.is_terminated())));

        let context = Context::full(&runtime).context("failed to create QuickJS context")?;
        let sandbox = Self { runtime, context };
        sandbox.install_globals(endpoint)?;
        Ok(sandbox)
    }

    fn install_globals(&self, endpoint: Rc<SandboxEndpoint>) -> Result<()> {
        self.context
            .with(|ctx| {
                let global = ctx.globals();
                let log_fn = Function::new(ctx.clone(), log_from_js)?.with_name("__bridge_log")?;
                global.set("__bridge_log", log_fn)?;

                let call_fn = Function::new(
                    ctx.clone(),
                    move |ctx: Ctx<'_>,
                          operation: String,
                          fields: String|
                          -> rquickjs::Result<String> {
                        match bridge_call(&endpoint, operation, &fields) {
                            Ok(reply) => Ok(reply),
                            Err(err) => bridge_error(&ctx, err),
                        }
                    },
                )?
                .with_name("__bridge_call")?;
                global.set("__bridge_call", call_fn)?;

                ctx.eval::<(), _>(CONSOLE_BOOTSTRAP.as_bytes())?;
                ctx.eval::<(), _>(BRIDGE_PRELUDE.as_bytes())
            })
            .map_err(anyhow::Error::from)
    }

    /// Execute all pending promise jobs.
    fn execute_pending_jobs(&self) {
        let mut job_count = 0;
        const MAX_JOBS: usize = 1000;

        while self.runtime.is_job_pending() {
            match self.runtime.execute_pending_job() {
                Ok(true) => {
                    job_count += 1;
                    if job_count >= MAX_JOBS {
                        tracing::warn!(
                            target: "sandbox",
                            "Stopped processing jobs after {} iterations (possible infinite loop)",
                            MAX_JOBS
                        );
                        break;
                    }
                }
                Ok(false) => break,
                Err(job_exception) => {
                    tracing::error!(target: "sandbox", "Job execution error: {:?}", job_exception);
                    break;
                }
            }
        }

        if job_count > 0 {
            tracing::debug!(target: "sandbox", "Executed {} pending jobs", job_count);
        }
    }

    fn with_source_url(source: &str, filename: &str) -> Vec<u8> {
        let mut script = String::with_capacity(source.len() + filename.len() + 32);
        script.push_str(source);
        if !source.ends_with('\n') {
            script.push('\n');
        }
        script.push_str("//# sourceURL=");
        script.push_str(filename);
        script.push('\n');
        script.into_bytes()
    }
}

impl ScriptEngine for QuickJsSandbox {
    fn bind_document(&mut self, document: Option<Handle>) -> Result<(), String> {
        self.context
            .with(|ctx| {
                let bind: Function = ctx.globals().get("__bridgeBindDocument")?;
                bind.call::<_, ()>((document.map(|handle| handle.0),))
            })
            .map_err(|err| err.to_string())
    }

    fn eval(&mut self, source: &str) -> Result<Option<JsonValue>, String> {
        let script = Self::with_source_url(source, "bridge-eval.js");
        let result = self.context.with(|ctx| -> rquickjs::Result<Option<String>> {
            let value: Value = ctx.eval(script)?;
            let json = ctx.json_stringify(value)?;
            json.map(|text| text.to_string()).transpose()
        });

        let outcome = match result {
            Ok(Some(text)) => serde_json::from_str(&text)
                .map(Some)
                .map_err(|err| err.to_string()),
            Ok(None) => Ok(None),
            Err(JsError::Exception) => Err(self
                .context
                .with(|ctx| capture_exception_message(&ctx))
                .unwrap_or_else(|| "QuickJS exception".to_string())),
            Err(err) => Err(err.to_string()),
        };

        self.execute_pending_jobs();
        outcome
    }
}

fn bridge_call(endpoint: &SandboxEndpoint, operation: String, fields: &str) -> BridgeResult<String> {
    let fields: JsonMap<String, JsonValue> = serde_json::from_str(fields)?;
    let reply = endpoint.call(Call { operation, fields })?;
    Ok(serde_json::to_string(&reply)?)
}

fn bridge_error<T>(ctx: &Ctx<'_>, err: BridgeError) -> rquickjs::Result<T> {
    if !matches!(err, BridgeError::Terminated) {
        tracing::error!(target: "sandbox", "bridge call failed: {err}");
    }
    let value = format!("bridge call failed: {err}").into_js(ctx)?;
    Err(ctx.throw(value))
}

fn log_from_js(message: String) -> rquickjs::Result<()> {
    tracing::info!(target: "sandbox", message = %message);
    Ok(())
}

fn capture_exception_message(ctx: &Ctx<'_>) -> Option<String> {
    let exception: Value = ctx.catch();

    if let Some(obj) = exception.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            return Some(format!("Error: {}", message));
        }
    }
    if let Some(text) = exception.as_string() {
        return text.to_string().ok();
    }

    Some(format!("{:?}", exception))
}

const CONSOLE_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const stringify = (value) => {
        try {
            if (typeof value === 'string') {
                return value;
            }
            if (value === undefined) {
                return 'undefined';
            }
            if (value === null) {
                return 'null';
            }
            return String(value);
        } catch (err) {
            return '[unprintable]';
        }
    };

    const logImpl = (...args) => {
        try {
            global.__bridge_log(args.map(stringify).join(' '));
        } catch (err) {
            // console must never throw
        }
    };

    global.console = {
        log: logImpl,
        error: logImpl,
        warn: logImpl,
        info: logImpl,
        debug: logImpl,
    };
})();
"#;

const BRIDGE_PRELUDE: &str = r#"
(() => {
    const global = globalThis;

    const call = (f, fields) => {
        const reply = JSON.parse(global.__bridge_call(f, JSON.stringify(fields || {})));
        if (reply.error !== undefined) {
            throw new Error(reply.error);
        }
        return reply;
    };

    const wrap = (ptr, Kind) => (ptr === undefined || ptr === null ? null : new Kind(ptr));

    const encodeArg = (arg) => {
        if (arg === undefined) {
            return 'undefined';
        }
        if (typeof arg === 'function') {
            return String(arg);
        }
        return JSON.stringify(arg);
    };

    class Element {
        constructor(ptr) {
            this.ptr = ptr;
        }
        get className() {
            return call('Element.getClassName', { ptr: this.ptr }).value ?? '';
        }
        set className(value) {
            call('Element.setClassName', { ptr: this.ptr, value: String(value) });
        }
        get textContent() {
            return call('Element.getTextContent', { ptr: this.ptr }).value ?? '';
        }
        set textContent(value) {
            call('Element.setTextContent', { ptr: this.ptr, value: String(value ?? '') });
        }
        get innerHTML() {
            return call('Element.getInnerHTML', { ptr: this.ptr }).value ?? '';
        }
        set innerHTML(value) {
            call('Element.setInnerHTML', { ptr: this.ptr, value: String(value ?? '') });
        }
        get contentDocument() {
            return wrap(call('Element.getContentDocument', { ptr: this.ptr }).ptr, Document);
        }
    }

    class Document {
        constructor(ptr) {
            this.ptr = ptr;
        }
        querySelector(selector) {
            return wrap(call('document.querySelector', { selector: String(selector) }).ptr, Element);
        }
        getElementById(id) {
            return wrap(call('document.getElementById', { id: String(id) }).ptr, Element);
        }
        open() {
            call('Document.open', { ptr: this.ptr });
            return this;
        }
        write(...parts) {
            call('Document.write', { ptr: this.ptr, value: parts.join('') });
        }
        close() {
            call('Document.close', { ptr: this.ptr });
        }
    }

    const location = {
        assign(url) {
            this.href = url;
        },
        toString() {
            return this.href;
        },
    };
    Object.defineProperty(location, 'href', {
        enumerable: true,
        get: () => call('location.getHref').value,
        set: (value) => {
            call('location.setHref', { value: String(value) });
        },
    });

    global.window = global;
    global.self = global;
    global.Element = Element;
    global.HTMLElement = Element;
    global.Document = Document;
    global.location = location;
    global.alert = (msg) => {
        call('alert', { msg: String(msg ?? '') });
    };
    global.parent = new Proxy({}, {
        get: (_, prop) => {
            if (typeof prop === 'symbol') {
                return undefined;
            }
            return (...args) => call('parent', { prop, args: args.map(encodeArg) }).value;
        },
    });
    global.__bridgeBindDocument = (ptr) => {
        global.document = new Document(ptr);
    };
})();
"#;
