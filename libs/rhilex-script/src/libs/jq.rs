//! `jq`: path queries over JSON documents
//!
//! Supported paths: `.`, `.name`, `."quoted name"`, `.[index]` (negative
//! counts from the end), `.[]` (every element) and chains of those such as
//! `.rows[].temp`.

use mlua::{Lua, Value};
use serde_json::Value as Json;

use super::json::{json_to_lua, lua_to_json};
use super::Namespace;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(i64),
    Iterate,
}

fn parse_path(path: &str) -> Result<Vec<Step>, String> {
    let path = path.trim();
    if !path.starts_with('.') {
        return Err(format!("path must start with '.': {}", path));
    }
    let chars: Vec<char> = path.chars().collect();
    let mut steps = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '.' => {
                i += 1;
                if i < chars.len() && chars[i] == '"' {
                    let end = chars[i + 1..]
                        .iter()
                        .position(|c| *c == '"')
                        .ok_or_else(|| "unterminated quoted key".to_string())?;
                    steps.push(Step::Key(chars[i + 1..i + 1 + end].iter().collect()));
                    i += end + 2;
                } else {
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    if i > start {
                        steps.push(Step::Key(chars[start..i].iter().collect()));
                    }
                }
            },
            '[' => {
                let end = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| "unterminated '['".to_string())?;
                let inner: String = chars[i + 1..i + end].iter().collect();
                let inner = inner.trim();
                if inner.is_empty() {
                    steps.push(Step::Iterate);
                } else if let Some(key) = inner.strip_prefix('"').and_then(|k| k.strip_suffix('"')) {
                    steps.push(Step::Key(key.to_string()));
                } else {
                    let index = inner
                        .parse::<i64>()
                        .map_err(|_| format!("invalid index: {}", inner))?;
                    steps.push(Step::Index(index));
                }
                i += end + 1;
            },
            other => return Err(format!("unexpected '{}' in path", other)),
        }
    }
    Ok(steps)
}

fn apply(step: &Step, input: Vec<Json>) -> Result<Vec<Json>, String> {
    let mut out = Vec::new();
    for value in input {
        match (step, value) {
            (Step::Key(k), Json::Object(mut map)) => out.push(map.remove(k).unwrap_or(Json::Null)),
            (Step::Key(_), Json::Null) => out.push(Json::Null),
            (Step::Key(k), other) => {
                return Err(format!("cannot index {} with \"{}\"", type_name(&other), k))
            },
            (Step::Index(n), Json::Array(mut items)) => {
                let len = items.len() as i64;
                let idx = if *n < 0 { len + n } else { *n };
                if (0..len).contains(&idx) {
                    out.push(items.swap_remove(idx as usize));
                } else {
                    out.push(Json::Null);
                }
            },
            (Step::Index(_), Json::Null) => out.push(Json::Null),
            (Step::Index(n), other) => {
                return Err(format!("cannot index {} with {}", type_name(&other), n))
            },
            (Step::Iterate, Json::Array(items)) => out.extend(items),
            (Step::Iterate, Json::Object(map)) => out.extend(map.into_iter().map(|(_, v)| v)),
            (Step::Iterate, other) => {
                return Err(format!("cannot iterate over {}", type_name(&other)))
            },
        }
    }
    Ok(out)
}

fn type_name(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

/// Evaluate `path` on `doc`; a path that fans out with `[]` yields an array
pub(crate) fn execute(doc: Json, path: &str) -> Result<Json, String> {
    let steps = parse_path(path)?;
    let fans_out = steps.contains(&Step::Iterate);
    let mut values = vec![doc];
    for step in &steps {
        values = apply(step, values)?;
    }
    if fans_out {
        Ok(Json::Array(values))
    } else {
        Ok(values.pop().unwrap_or(Json::Null))
    }
}

pub(super) fn install(lua: &Lua) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "jq")?;
    ns.add("Execute", |lua, (doc, path): (Value, String)| {
        let doc = match doc {
            Value::String(s) => match serde_json::from_slice::<Json>(s.as_bytes()) {
                Ok(v) => v,
                Err(e) => return Ok((Value::Nil, Some(e.to_string()))),
            },
            other => lua_to_json(lua, other)?,
        };
        match execute(doc, &path) {
            Ok(v) => Ok((json_to_lua(lua, &v)?, None)),
            Err(e) => Ok((Value::Nil, Some(e))),
        }
    })?;
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_paths() {
        let doc = json!({"rows": [{"temp": 1}, {"temp": 2}], "name": "m1", "a b": 3});
        assert_eq!(execute(doc.clone(), ".").unwrap(), doc);
        assert_eq!(execute(doc.clone(), ".name").unwrap(), json!("m1"));
        assert_eq!(execute(doc.clone(), ".rows[1].temp").unwrap(), json!(2));
        assert_eq!(execute(doc.clone(), ".rows[-1].temp").unwrap(), json!(2));
        assert_eq!(execute(doc.clone(), ".rows[].temp").unwrap(), json!([1, 2]));
        assert_eq!(execute(doc.clone(), ".\"a b\"").unwrap(), json!(3));
        assert_eq!(execute(doc.clone(), ".missing.deeper").unwrap(), Json::Null);
        assert!(execute(doc.clone(), ".name.x").is_err());
        assert!(execute(doc, "name").is_err());
    }

    #[test]
    fn test_lua_execute() {
        let lua = crate::libs::testing::vm();
        let temp: i64 = lua
            .load(r#"return jq:Execute('{"rows":[{"temp":7}]}', ".rows[0].temp")"#)
            .eval()
            .unwrap();
        assert_eq!(temp, 7);
    }
}
