//! The bundled SDK.
//!
//! `sdk.*` is pure and allowed in the sandbox by default. `host.*` touches
//! the filesystem and environment and has to be allowed explicitly, or run
//! without the sandbox.

use serde_json::{json, Map, Value};

use super::registry::{
    arg_array, arg_str, arg_u64, Args, CallContext, FunctionError, FunctionResult, Registry,
};

const DEFAULT_SEPARATOR: &str = ", ";
const DEFAULT_SEED: u64 = 0;

pub fn install(registry: &mut Registry) {
    registry.register_constructor("sdk.Prompt.create", |params| {
        let args: Args = params.clone().into_iter().collect();
        prompt(&args)
    });
    registry.register_function("sdk.Prompt.create", |ctx, args| {
        if ctx.prepare {
            return Ok(Value::Null);
        }
        prompt(args)
    });

    registry.register_function("sdk.text.join", |ctx, args| {
        if ctx.prepare {
            return Ok(Value::Null);
        }
        text_join(args)
    });

    registry.register_function("sdk.image.canvas", |ctx, args| {
        if ctx.prepare {
            return Ok(Value::Null);
        }
        canvas(ctx, args)
    });

    registry.register_constructor("sdk.random.seed", |params| {
        Ok(Value::from(seed_value(params.get("value"))))
    });
    registry.register_function("sdk.random.seed", |ctx, args| {
        if ctx.prepare {
            return Ok(Value::Null);
        }
        let value = args.get("value").or_else(|| ctx.option("seed"));
        Ok(Value::from(seed_value(value)))
    });

    registry.register_function("host.fs.read_text", |ctx, args| {
        if ctx.prepare {
            return Ok(Value::Null);
        }
        let path = arg_str(args, "path")?;
        Ok(Value::String(std::fs::read_to_string(path)?))
    });
    registry.register_function("host.fs.write_text", |ctx, args| {
        if ctx.prepare {
            return Ok(Value::Null);
        }
        let path = arg_str(args, "path")?;
        let text = arg_str(args, "text")?;
        std::fs::write(path, text)?;
        Ok(Value::String(path.to_string()))
    });
    registry.register_function("host.env.var", |ctx, args| {
        if ctx.prepare {
            return Ok(Value::Null);
        }
        let name = arg_str(args, "name")?;
        Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
    });
}

/// Text carried by a string or a prompt object.
fn text_of(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(map) if map.get("type") == Some(&json!("prompt")) => {
            map.get("text").and_then(Value::as_str)
        }
        _ => None,
    }
}

fn prompt(args: &Args) -> FunctionResult {
    let text = arg_str(args, "text")?;
    let negative = match args.get("negative") {
        None | Some(Value::Null) => "",
        Some(v) => v.as_str().ok_or(FunctionError::InvalidArg {
            name: "negative".to_string(),
            expected: "a string",
        })?,
    };
    Ok(json!({ "type": "prompt", "text": text, "negative": negative }))
}

fn text_join(args: &Args) -> FunctionResult {
    let parts = arg_array(args, "parts")?;
    let separator = match args.get("separator") {
        Some(v) => v.as_str().ok_or(FunctionError::InvalidArg {
            name: "separator".to_string(),
            expected: "a string",
        })?,
        None => DEFAULT_SEPARATOR,
    };
    let texts = parts
        .iter()
        .map(|p| {
            text_of(p).ok_or(FunctionError::InvalidArg {
                name: "parts".to_string(),
                expected: "strings or prompts",
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::String(texts.join(separator)))
}

fn canvas(ctx: &CallContext<'_>, args: &Args) -> FunctionResult {
    let width = arg_u64(args, "width")?;
    let height = arg_u64(args, "height")?;
    if width == 0 || height == 0 {
        return Err(FunctionError::Failed(format!(
            "canvas must not be empty, got {width}x{height}"
        )));
    }
    let color = args.get("color").cloned().unwrap_or(json!("black"));
    let seed = seed_value(ctx.option("seed"));
    Ok(json!({
        "type": "image",
        "width": width,
        "height": height,
        "color": color,
        "seed": seed,
    }))
}

fn seed_value(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(DEFAULT_SEED)
}
