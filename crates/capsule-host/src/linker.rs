//! Capability registration for interpreter engines.
//!
//! Installs the host surface into a Rhai [`Engine`]:
//! - `http::request(method, url, data?, options?, callback?)`,
//!   `http::get(url, ...)`, `http::post(url, ...)` returning a `Response`
//! - `console::log`, `console::debug`, `console::error`
//! - `json::parse`, `json::stringify`
//! - `print` and `debug` routed to the context's sinks
//!
//! Every handler closes over the [`HostState`] passed in, so an engine is
//! bound to exactly one state. Copying a context means building a new
//! engine around a new state.

use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Module, NativeCallContext};

use crate::http_outbound::{HttpMethod, HttpRequest, RequestData, RequestOptions};
use crate::logging::{self, ConsoleLevel};
use crate::{HostState, ScriptResponse, json};

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

/// Create an engine with every capability bound to `state`.
pub fn build_engine(state: &Arc<HostState>) -> Engine {
    let mut engine = Engine::new();
    register_all(&mut engine, state);
    engine
}

/// Register all capabilities on `engine`.
pub fn register_all(engine: &mut Engine, state: &Arc<HostState>) {
    register_output(engine, state);
    register_response(engine);
    engine.register_static_module("http", http_module(state).into());
    engine.register_static_module("console", console_module(state).into());
    engine.register_static_module("json", json_module().into());
}

/// Route the interpreter's own `print` and `debug` to the context sinks.
pub fn register_output(engine: &mut Engine, state: &Arc<HostState>) {
    let out = Arc::clone(state);
    engine.on_print(move |text| logging::log(&out, ConsoleLevel::Log, text));

    let dbg = Arc::clone(state);
    engine.on_debug(move |text, _source, _pos| logging::log(&dbg, ConsoleLevel::Debug, text));
}

/// Register the `Response` type and its accessors.
pub fn register_response(engine: &mut Engine) {
    engine
        .register_type_with_name::<ScriptResponse>("Response")
        .register_get("url", |r: &mut ScriptResponse| r.url.clone())
        .register_get("body", |r: &mut ScriptResponse| r.body.clone())
        .register_get("status", |r: &mut ScriptResponse| i64::from(r.status))
        .register_get("request_url", |r: &mut ScriptResponse| r.request_url.clone())
        .register_get("headers", |r: &mut ScriptResponse| r.headers_map())
        .register_get("error", |r: &mut ScriptResponse| r.error_value())
        .register_get("is_ok", |r: &mut ScriptResponse| r.is_ok())
        .register_fn("to_map", |r: &mut ScriptResponse| r.to_map())
        .register_fn("to_string", |r: &mut ScriptResponse| r.to_string())
        .register_fn("to_debug", |r: &mut ScriptResponse| format!("{r:?}"));
}

fn http_module(state: &Arc<HostState>) -> Module {
    let mut module = Module::new();

    for (name, method) in [("get", "GET"), ("post", "POST")] {
        let s = Arc::clone(state);
        module.set_native_fn(name, move |ctx: NativeCallContext, url: ImmutableString| {
            send(&ctx, &s, method, &url, &Dynamic::UNIT, None, None)
        });
        let s = Arc::clone(state);
        module.set_native_fn(name, move |ctx: NativeCallContext, url: ImmutableString, callback: FnPtr| {
            send(&ctx, &s, method, &url, &Dynamic::UNIT, None, Some(&callback))
        });
        let s = Arc::clone(state);
        module.set_native_fn(name, move |ctx: NativeCallContext, url: ImmutableString, data: Dynamic| {
            send(&ctx, &s, method, &url, &data, None, None)
        });
        let s = Arc::clone(state);
        module.set_native_fn(
            name,
            move |ctx: NativeCallContext, url: ImmutableString, data: Dynamic, callback: FnPtr| {
                send(&ctx, &s, method, &url, &data, None, Some(&callback))
            },
        );
        let s = Arc::clone(state);
        module.set_native_fn(
            name,
            move |ctx: NativeCallContext, url: ImmutableString, data: Dynamic, options: Map| {
                send(&ctx, &s, method, &url, &data, Some(&options), None)
            },
        );
        let s = Arc::clone(state);
        module.set_native_fn(
            name,
            move |ctx: NativeCallContext,
                  url: ImmutableString,
                  data: Dynamic,
                  options: Map,
                  callback: FnPtr| {
                send(&ctx, &s, method, &url, &data, Some(&options), Some(&callback))
            },
        );
    }

    let s = Arc::clone(state);
    module.set_native_fn(
        "request",
        move |ctx: NativeCallContext, method: ImmutableString, url: ImmutableString| {
            send(&ctx, &s, &method, &url, &Dynamic::UNIT, None, None)
        },
    );
    let s = Arc::clone(state);
    module.set_native_fn(
        "request",
        move |ctx: NativeCallContext, method: ImmutableString, url: ImmutableString, callback: FnPtr| {
            send(&ctx, &s, &method, &url, &Dynamic::UNIT, None, Some(&callback))
        },
    );
    let s = Arc::clone(state);
    module.set_native_fn(
        "request",
        move |ctx: NativeCallContext, method: ImmutableString, url: ImmutableString, data: Dynamic| {
            send(&ctx, &s, &method, &url, &data, None, None)
        },
    );
    let s = Arc::clone(state);
    module.set_native_fn(
        "request",
        move |ctx: NativeCallContext,
              method: ImmutableString,
              url: ImmutableString,
              data: Dynamic,
              callback: FnPtr| {
            send(&ctx, &s, &method, &url, &data, None, Some(&callback))
        },
    );
    let s = Arc::clone(state);
    module.set_native_fn(
        "request",
        move |ctx: NativeCallContext,
              method: ImmutableString,
              url: ImmutableString,
              data: Dynamic,
              options: Map| {
            send(&ctx, &s, &method, &url, &data, Some(&options), None)
        },
    );
    let s = Arc::clone(state);
    module.set_native_fn(
        "request",
        move |ctx: NativeCallContext,
              method: ImmutableString,
              url: ImmutableString,
              data: Dynamic,
              options: Map,
              callback: FnPtr| {
            send(&ctx, &s, &method, &url, &data, Some(&options), Some(&callback))
        },
    );

    module
}

/// Perform one script request and hand the response to `callback`, if any.
fn send(
    ctx: &NativeCallContext,
    state: &HostState,
    method: &str,
    url: &str,
    data: &Dynamic,
    options: Option<&Map>,
    callback: Option<&FnPtr>,
) -> ScriptResult<ScriptResponse> {
    let response = match HttpMethod::parse(method) {
        Ok(method) => {
            let options = options.map(request_options).transpose()?.unwrap_or_default();
            let request = HttpRequest::from_script(method, url, &request_data(data), options);
            logging::log(
                state,
                ConsoleLevel::Debug,
                &format!("{} - {}", method.as_str(), request.uri),
            );
            ScriptResponse::from_outcome(&request.uri, state.fetch().send_request(&request))
        }
        Err(e) => ScriptResponse::error(url, e.to_string()),
    };

    if let Some(callback) = callback {
        callback.call_within_context::<Dynamic>(ctx, (response.clone(),))?;
    }

    Ok(response)
}

/// Interpret the `data` argument: maps are form-encoded, `()` is nothing,
/// anything else is used as literal text.
fn request_data(data: &Dynamic) -> RequestData {
    if data.is_unit() {
        return RequestData::None;
    }
    if let Some(map) = data.read_lock::<Map>() {
        return RequestData::Form(
            map.iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        );
    }
    RequestData::Raw(data.to_string())
}

/// Interpret the `options` argument. Unknown keys are ignored.
fn request_options(options: &Map) -> ScriptResult<RequestOptions> {
    let mut parsed = RequestOptions::default();

    for (key, value) in options {
        match key.to_lowercase().as_str() {
            "headers" => {
                let headers = value
                    .read_lock::<Map>()
                    .ok_or_else(|| Box::<EvalAltResult>::from("headers must be an object map"))?;
                parsed.headers = headers
                    .iter()
                    .map(|(name, value)| (name.to_string(), value.to_string()))
                    .collect();
            }
            "cache" => parsed.cache = value.as_bool().unwrap_or(false),
            _ => {}
        }
    }

    Ok(parsed)
}

fn console_module(state: &Arc<HostState>) -> Module {
    let mut module = Module::new();

    for (name, level) in [
        ("log", ConsoleLevel::Log),
        ("debug", ConsoleLevel::Debug),
        ("error", ConsoleLevel::Error),
    ] {
        let s = Arc::clone(state);
        module.set_native_fn(name, move |a: Dynamic| -> ScriptResult<()> {
            logging::log(&s, level, &logging::join_args(&[a]));
            Ok(())
        });
        let s = Arc::clone(state);
        module.set_native_fn(name, move |a: Dynamic, b: Dynamic| -> ScriptResult<()> {
            logging::log(&s, level, &logging::join_args(&[a, b]));
            Ok(())
        });
        let s = Arc::clone(state);
        module.set_native_fn(name, move |a: Dynamic, b: Dynamic, c: Dynamic| -> ScriptResult<()> {
            logging::log(&s, level, &logging::join_args(&[a, b, c]));
            Ok(())
        });
    }

    module
}

fn json_module() -> Module {
    let mut module = Module::new();

    module.set_native_fn("parse", |text: ImmutableString| -> ScriptResult<Dynamic> {
        json::parse(&text).map_err(|e| e.to_string().into())
    });
    module.set_native_fn("stringify", |value: Dynamic| -> ScriptResult<String> {
        json::stringify(&value).map_err(|e| e.to_string().into())
    });

    module
}
