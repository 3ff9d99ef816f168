//! Safe builtins available to every workflow without an import.

use serde_json::{json, Number, Value};

use super::registry::{arg, arg_array, arg_f64, Args, CallContext, FunctionError, FunctionResult};

pub const BUILTINS: &[&str] = &[
    "add", "sub", "mul", "div", "abs", "round", "min", "max", "sum", "len", "get", "concat",
    "print",
];

pub fn is_builtin(op: &str) -> bool {
    BUILTINS.contains(&op)
}

/// Run a builtin. `None` when `op` is not a builtin.
pub fn call(op: &str, ctx: &CallContext<'_>, args: &Args) -> Option<FunctionResult> {
    let result = match op {
        "add" => arithmetic(args, i64::checked_add, |a, b| a + b),
        "sub" => arithmetic(args, i64::checked_sub, |a, b| a - b),
        "mul" => arithmetic(args, i64::checked_mul, |a, b| a * b),
        "div" => div(args),
        "abs" => abs(args),
        "round" => round(args),
        "min" => extremum(args, |a, b| a < b),
        "max" => extremum(args, |a, b| a > b),
        "sum" => sum(args),
        "len" => len(args),
        "get" => get(args),
        "concat" => concat(args),
        "print" => print(ctx, args),
        _ => return None,
    };
    Some(result)
}

fn float(value: f64) -> FunctionResult {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| FunctionError::Failed(format!("result {value} is not a finite number")))
}

fn arithmetic(
    args: &Args,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> FunctionResult {
    let a = arg(args, "a")?;
    let b = arg(args, "b")?;
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return int_op(x, y)
            .map(Value::from)
            .ok_or_else(|| FunctionError::Failed("integer overflow".to_string()));
    }
    float(float_op(arg_f64(args, "a")?, arg_f64(args, "b")?))
}

fn div(args: &Args) -> FunctionResult {
    let b = arg_f64(args, "b")?;
    if b == 0.0 {
        return Err(FunctionError::Failed("division by zero".to_string()));
    }
    float(arg_f64(args, "a")? / b)
}

fn abs(args: &Args) -> FunctionResult {
    match arg(args, "x")?.as_i64() {
        Some(x) => x
            .checked_abs()
            .map(Value::from)
            .ok_or_else(|| FunctionError::Failed("integer overflow".to_string())),
        None => float(arg_f64(args, "x")?.abs()),
    }
}

fn round(args: &Args) -> FunctionResult {
    let x = arg_f64(args, "x")?;
    let digits = args.get("digits").and_then(Value::as_i64).unwrap_or(0);
    if digits == 0 {
        // Whole numbers come back as integers.
        return Ok(Value::from(x.round() as i64));
    }
    let scale = 10f64.powi(digits as i32);
    float((x * scale).round() / scale)
}

fn numbers(args: &Args) -> Result<Vec<&Value>, FunctionError> {
    let values = arg_array(args, "values")?;
    if values.iter().any(|v| !v.is_number()) {
        return Err(FunctionError::InvalidArg {
            name: "values".to_string(),
            expected: "a list of numbers",
        });
    }
    Ok(values.iter().collect())
}

fn extremum(args: &Args, better: fn(f64, f64) -> bool) -> FunctionResult {
    let values = numbers(args)?;
    let mut best: Option<&Value> = None;
    for value in values {
        let replace = match best {
            None => true,
            Some(current) => better(
                value.as_f64().unwrap_or_default(),
                current.as_f64().unwrap_or_default(),
            ),
        };
        if replace {
            best = Some(value);
        }
    }
    best.cloned()
        .ok_or_else(|| FunctionError::Failed("empty list".to_string()))
}

fn sum(args: &Args) -> FunctionResult {
    let values = numbers(args)?;
    if values.iter().all(|v| v.is_i64()) {
        let mut total: i64 = 0;
        for v in values {
            total = total
                .checked_add(v.as_i64().unwrap_or_default())
                .ok_or_else(|| FunctionError::Failed("integer overflow".to_string()))?;
        }
        return Ok(Value::from(total));
    }
    float(values.iter().filter_map(|v| v.as_f64()).sum())
}

fn len(args: &Args) -> FunctionResult {
    let n = match arg(args, "value")? {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        Value::String(s) => s.chars().count(),
        _ => {
            return Err(FunctionError::InvalidArg {
                name: "value".to_string(),
                expected: "a list, mapping or string",
            })
        }
    };
    Ok(Value::from(n))
}

fn get(args: &Args) -> FunctionResult {
    let value = arg(args, "value")?;
    let key = arg(args, "key")?;
    let found = match (value, key) {
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| items.get(i as usize)),
        (Value::Object(map), Value::String(k)) => map.get(k),
        _ => {
            return Err(FunctionError::InvalidArg {
                name: "key".to_string(),
                expected: "an index into a list or a key into a mapping",
            })
        }
    };
    match found {
        Some(v) => Ok(v.clone()),
        None => args
            .get("default")
            .cloned()
            .ok_or_else(|| FunctionError::Failed(format!("key {key} not found"))),
    }
}

fn concat(args: &Args) -> FunctionResult {
    let parts = arg_array(args, "parts")?;
    if parts.iter().all(Value::is_string) {
        let joined: String = parts.iter().filter_map(Value::as_str).collect();
        return Ok(Value::String(joined));
    }
    if parts.iter().all(Value::is_array) {
        let joined: Vec<Value> = parts
            .iter()
            .filter_map(Value::as_array)
            .flatten()
            .cloned()
            .collect();
        return Ok(Value::Array(joined));
    }
    Err(FunctionError::InvalidArg {
        name: "parts".to_string(),
        expected: "all strings or all lists",
    })
}

fn print(ctx: &CallContext<'_>, args: &Args) -> FunctionResult {
    let value = arg(args, "value")?;
    let line = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    ctx.print(line);
    Ok(json!(null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use std::cell::RefCell;

    fn run(op: &str, args: Value) -> FunctionResult {
        let args: Args = serde_json::from_value(args).unwrap();
        let printed = RefCell::new(Vec::new());
        let options = Map::new();
        let ctx = CallContext::new(false, "n", &options, &printed);
        call(op, &ctx, &args).expect("builtin")
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(run("add", json!({"a": 2, "b": 3})).unwrap(), json!(5));
        assert_eq!(run("sub", json!({"a": 2, "b": 3})).unwrap(), json!(-1));
        assert_eq!(run("mul", json!({"a": 4, "b": 3})).unwrap(), json!(12));
        assert_eq!(run("add", json!({"a": 1.5, "b": 1})).unwrap(), json!(2.5));
    }

    #[test]
    fn division_by_zero_fails() {
        assert!(run("div", json!({"a": 1, "b": 0})).is_err());
        assert_eq!(run("div", json!({"a": 3, "b": 2})).unwrap(), json!(1.5));
    }

    #[test]
    fn overflow_is_an_error() {
        assert!(run("add", json!({"a": i64::MAX, "b": 1})).is_err());
    }

    #[test]
    fn aggregates() {
        assert_eq!(run("sum", json!({"values": [1, 2, 3]})).unwrap(), json!(6));
        assert_eq!(run("min", json!({"values": [4, 2, 9]})).unwrap(), json!(2));
        assert_eq!(run("max", json!({"values": [4, 2.5, 9]})).unwrap(), json!(9));
        assert!(run("max", json!({"values": []})).is_err());
        assert!(run("sum", json!({"values": [1, "x"]})).is_err());
    }

    #[test]
    fn rounding() {
        assert_eq!(run("round", json!({"x": 2.6})).unwrap(), json!(3));
        assert_eq!(run("round", json!({"x": 2.346, "digits": 2})).unwrap(), json!(2.35));
        assert_eq!(run("abs", json!({"x": -4})).unwrap(), json!(4));
    }

    #[test]
    fn len_get_concat() {
        assert_eq!(run("len", json!({"value": "héllo"})).unwrap(), json!(5));
        assert_eq!(run("get", json!({"value": [10, 20], "key": 1})).unwrap(), json!(20));
        assert_eq!(run("get", json!({"value": {"a": 1}, "key": "b", "default": 0})).unwrap(), json!(0));
        assert!(run("get", json!({"value": {"a": 1}, "key": "b"})).is_err());
        assert_eq!(run("concat", json!({"parts": ["a", "b"]})).unwrap(), json!("ab"));
        assert_eq!(run("concat", json!({"parts": [[1], [2, 3]]})).unwrap(), json!([1, 2, 3]));
        assert!(run("concat", json!({"parts": ["a", [1]]})).is_err());
    }

    #[test]
    fn print_goes_to_collector() {
        let args: Args = serde_json::from_value(json!({"value": {"k": 1}})).unwrap();
        let printed = RefCell::new(Vec::new());
        let options = Map::new();
        let ctx = CallContext::new(false, "n", &options, &printed);
        call("print", &ctx, &args).unwrap().unwrap();
        assert_eq!(printed.into_inner(), vec![r#"{"k":1}"#]);
    }

    #[test]
    fn unknown_op_is_not_a_builtin() {
        assert!(!is_builtin("exec"));
        let printed = RefCell::new(Vec::new());
        let options = Map::new();
        let ctx = CallContext::new(false, "n", &options, &printed);
        assert!(call("exec", &ctx, &Args::new()).is_none());
    }
}
