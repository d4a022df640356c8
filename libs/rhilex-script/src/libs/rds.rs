//! `rds`: rows in the in-memory data center

use std::sync::Arc;

use mlua::{Lua, Value};
use serde_json::{Map, Value as Json};

use super::json::{json_to_lua, lua_to_json};
use super::{err_only, pair, Namespace};
use crate::env::VmContext;

fn fields(lua: &Lua, value: Value<'_>) -> mlua::Result<Result<Map<String, Json>, String>> {
    Ok(match lua_to_json(lua, value)? {
        Json::Object(map) => Ok(map),
        other => Err(format!("row must be a key/value table, got {}", other)),
    })
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "rds")?;
    let dc = Arc::clone(&ctx.env.runtime().datacenter);

    let center = Arc::clone(&dc);
    ns.add("Save", move |lua, (table, row): (String, Value)| {
        Ok(pair(
            fields(lua, row)?.and_then(|row| center.save(&table, row).map_err(|e| e.to_string())),
        ))
    })?;

    let center = Arc::clone(&dc);
    ns.add(
        "List",
        move |lua, (table, page, size): (String, Option<usize>, Option<usize>)| {
            let rows = center.list(&table, page.unwrap_or(1), size.unwrap_or(10));
            json_to_lua(lua, &Json::Array(rows))
        },
    )?;

    let center = Arc::clone(&dc);
    ns.add("Last", move |lua, table: String| match center.last(&table) {
        Some(row) => json_to_lua(lua, &row),
        None => Ok(Value::Nil),
    })?;

    let center = dc;
    ns.add("UpdateLast", move |lua, (table, row): (String, Value)| {
        Ok(err_only(fields(lua, row)?.and_then(|row| {
            center.update_last(&table, row).map_err(|e| e.to_string())
        })))
    })?;
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use crate::libs::testing::vm;

    #[test]
    fn test_save_and_read_back() {
        let lua = vm();
        let (count, temp, err): (i64, f64, Option<String>) = lua
            .load(
                r#"
                rds:Save("meter", { temp = 20.5 })
                local _, err = rds:Save("meter", 1)
                rds:UpdateLast("meter", { temp = 21.5 })
                local rows = rds:List("meter", 1, 10)
                return #rows, rds:Last("meter").temp, err
                "#,
            )
            .eval()
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(temp, 21.5);
        assert!(err.is_some());
    }
}
