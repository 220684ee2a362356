//! Functions callable from template actions. Functions which take a
//! "subject" accept it as their final argument, so they compose in pipelines:
//! `[[ .hosts | join "," ]]`.

use serde_json::Value;

const FUNCS: &[&str] = &[
    "join",
    "joinStringValues",
    "lower",
    "regexMatch",
    "replaceAll",
    "strings",
    "title",
    "upper",
];

pub fn exists(name: &str) -> bool {
    FUNCS.contains(&name)
}

pub fn call(name: &str, args: Vec<Value>) -> Result<Value, String> {
    match name {
        "upper" => {
            let [s] = arity::<1>(name, args)?;
            Ok(Value::String(string(&s)?.to_uppercase()))
        }
        "lower" => {
            let [s] = arity::<1>(name, args)?;
            Ok(Value::String(string(&s)?.to_lowercase()))
        }
        "title" => {
            let [s] = arity::<1>(name, args)?;
            Ok(Value::String(title(string(&s)?)))
        }
        "join" => {
            let [sep, list] = arity::<2>(name, args)?;
            let parts = match &list {
                Value::Array(items) => items.iter().map(string).collect::<Result<Vec<_>, _>>()?,
                other => return Err(format!("join: expected a list; got {}", type_name(other))),
            };
            Ok(Value::String(parts.join(string(&sep)?)))
        }
        "joinStringValues" => {
            let [sep, map] = arity::<2>(name, args)?;
            let Value::Object(map) = &map else {
                return Err(format!(
                    "joinStringValues: expected a map; got {}",
                    type_name(&map)
                ));
            };
            // Join in key order, independent of map representation.
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let parts = entries
                .into_iter()
                .map(|(_, v)| string(v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::String(parts.join(string(&sep)?)))
        }
        "regexMatch" => {
            let [pattern, s] = arity::<2>(name, args)?;
            let re = regex(string(&pattern)?)?;
            Ok(Value::Bool(re.is_match(string(&s)?)))
        }
        "replaceAll" => {
            let [pattern, replacement, s] = arity::<3>(name, args)?;
            let re = regex(string(&pattern)?)?;
            Ok(Value::String(
                re.replace_all(string(&s)?, string(&replacement)?)
                    .into_owned(),
            ))
        }
        "strings" => Ok(Value::Array(
            args.iter()
                .map(|arg| string(arg).map(|s| Value::String(s.to_string())))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        _ => Err(format!("function {name:?} not defined")),
    }
}

fn arity<const N: usize>(name: &str, args: Vec<Value>) -> Result<[Value; N], String> {
    let len = args.len();
    args.try_into()
        .map_err(|_| format!("wrong number of args for {name}: want {N} got {len}"))
}

fn string(value: &Value) -> Result<&str, String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(format!("expected string; got {}", type_name(other))),
    }
}

fn regex(pattern: &str) -> Result<regex::Regex, String> {
    regex::Regex::new(pattern).map_err(|err| format!("invalid pattern {pattern:?}: {err}"))
}

/// Upper-case the first letter of every word, where words are separated by
/// anything other than letters, digits, and underscores.
fn title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_boundary = true;

    for c in s.chars() {
        if at_boundary {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        at_boundary = !(c.is_alphanumeric() || c == '_');
    }
    out
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
