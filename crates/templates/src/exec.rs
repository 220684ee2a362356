use super::funcs::{self, type_name};
use super::parse::{Node, Operand, Pipeline};
use super::Error;
use serde_json::Value;

/// Execute `nodes` against `dot`, appending output to `out`.
pub fn execute(nodes: &[Node], dot: &Value, out: &mut String) -> Result<(), Error> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Action(pipeline) => print(&eval(pipeline, dot)?, out),
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                if truthy(&eval(cond, dot)?) {
                    execute(then, dot, out)?;
                } else {
                    execute(otherwise, dot, out)?;
                }
            }
            Node::Range {
                over,
                body,
                otherwise,
            } => {
                let over_value = eval(over, dot)?;
                let items: Vec<&Value> = match &over_value {
                    Value::Null => Vec::new(),
                    Value::Array(items) => items.iter().collect(),
                    Value::Object(map) => {
                        let mut entries: Vec<_> = map.iter().collect();
                        entries.sort_by(|a, b| a.0.cmp(b.0));
                        entries.into_iter().map(|(_, v)| v).collect()
                    }
                    other => {
                        return Err(Error::Exec {
                            line: over.line,
                            message: format!("range can't iterate over {}", type_name(other)),
                        })
                    }
                };

                if items.is_empty() {
                    execute(otherwise, dot, out)?;
                }
                for item in items {
                    execute(body, item, out)?;
                }
            }
        }
    }
    Ok(())
}

fn eval(pipeline: &Pipeline, dot: &Value) -> Result<Value, Error> {
    let err = |message: String| Error::Exec {
        line: pipeline.line,
        message,
    };
    let mut piped: Option<Value> = None;

    for command in &pipeline.commands {
        let (head, rest) = command
            .operands
            .split_first()
            .ok_or_else(|| err("missing value for command".to_string()))?;

        let value = match head {
            Operand::Func(name) => {
                let mut args = rest
                    .iter()
                    .map(|operand| operand_value(operand, dot, pipeline.line))
                    .collect::<Result<Vec<_>, _>>()?;
                args.extend(piped.take());

                funcs::call(name, args).map_err(|message| err(format!("calling {name}: {message}")))?
            }
            operand => {
                if piped.is_some() {
                    return Err(err(format!("can't give argument to non-function {operand:?}")));
                }
                operand_value(operand, dot, pipeline.line)?
            }
        };
        piped = Some(value);
    }

    piped.ok_or_else(|| err("missing value for command".to_string()))
}

fn operand_value(operand: &Operand, dot: &Value, line: usize) -> Result<Value, Error> {
    match operand {
        Operand::Dot => Ok(dot.clone()),
        Operand::Field(path) => field(dot, path, line),
        Operand::Func(name) => funcs::call(name, Vec::new()).map_err(|message| Error::Exec {
            line,
            message: format!("calling {name}: {message}"),
        }),
        Operand::Str(s) => Ok(Value::String(s.clone())),
        Operand::Int(i) => Ok(Value::from(*i)),
        Operand::Bool(b) => Ok(Value::Bool(*b)),
        Operand::Pipeline(pipeline) => eval(pipeline, dot),
    }
}

fn field(dot: &Value, path: &[String], line: usize) -> Result<Value, Error> {
    let mut cur = dot;

    for name in path {
        cur = match cur {
            Value::Object(map) => map.get(name).ok_or_else(|| Error::Exec {
                line,
                message: format!("map has no entry for key {name:?}"),
            })?,
            other => {
                return Err(Error::Exec {
                    line,
                    message: format!("can't evaluate field {name} in type {}", type_name(other)),
                })
            }
        };
    }
    Ok(cur.clone())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn print(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("<no value>"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index != 0 {
                    out.push(' ');
                }
                print(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push_str("map[");
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index != 0 {
                    out.push(' ');
                }
                out.push_str(key);
                out.push(':');
                print(item, out);
            }
            out.push(']');
        }
    }
}
