//! `Debug` and `Throw`

use std::sync::Arc;

use common::logging::SCRIPT_TARGET;
use mlua::{Lua, Value, Variadic};
use tracing::info;

use super::to_display;
use crate::env::{ScriptScope, VmContext};

/// Content with this prefix comes from the rule test console
pub const TEST_RULE_PREFIX: &str = "::::TEST_RULE::::";

/// Topic and text of one `Debug` call
pub(crate) fn route_debug(ctx: &VmContext, content: &str) -> (String, String) {
    if ctx.scope == ScriptScope::Rule {
        if let Some(rest) = content.strip_prefix(TEST_RULE_PREFIX) {
            let text = if rest.is_empty() { "<Empty>" } else { rest };
            return (format!("rule/log/test/{}", ctx.uuid), text.to_string());
        }
    }
    (ctx.log_topic(), content.to_string())
}

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let globals = lua.globals();

    let vm = Arc::clone(ctx);
    let debug = lua.create_function(move |lua, args: Variadic<Value>| {
        let mut parts = Vec::with_capacity(args.len());
        for v in args.iter() {
            parts.push(to_display(lua, v.clone())?);
        }
        let (topic, text) = route_debug(&vm, &parts.join("  "));
        info!(target: SCRIPT_TARGET, topic = %topic, "{}", text);
        Ok(())
    })?;
    globals.raw_set("Debug", debug)?;

    let throw = lua.create_function(|lua, msg: Value| {
        let text = to_display(lua, msg)?;
        Err::<(), _>(mlua::Error::runtime(text))
    })?;
    globals.raw_set("Throw", throw)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::libs::testing::{detached_ctx, vm};

    #[test]
    fn test_debug_routing() {
        let ctx = detached_ctx();
        assert_eq!(
            route_debug(&ctx, "hello"),
            ("rule/log/test-vm".to_string(), "hello".to_string())
        );
        assert_eq!(
            route_debug(&ctx, "::::TEST_RULE::::x"),
            ("rule/log/test/test-vm".to_string(), "x".to_string())
        );
        assert_eq!(route_debug(&ctx, TEST_RULE_PREFIX).1, "<Empty>");
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_debug_joins_arguments() {
        let lua = vm();
        lua.load(r#"Debug("a", 1, true)"#).exec().unwrap();
        assert!(logs_contain("a  1  true"));
        assert!(logs_contain("rule/log/test-vm"));
    }

    #[test]
    fn test_throw_raises() {
        let lua = vm();
        let err = lua.load(r#"Throw("bad input")"#).exec().unwrap_err();
        assert!(crate::error::describe(&err).contains("bad input"));
    }
}
