//! `kv`: the gateway's in-memory key/value store

use std::sync::Arc;
use std::time::Duration;

use mlua::Lua;

use super::{err_only, Namespace};
use crate::env::VmContext;

pub(super) fn install(lua: &Lua, ctx: &Arc<VmContext>) -> mlua::Result<()> {
    let ns = Namespace::new(lua, "kv")?;
    let kv = Arc::clone(&ctx.env.runtime().kv);

    let store = Arc::clone(&kv);
    ns.add("VSet", move |_, (key, value): (String, String)| {
        Ok(err_only(store.set(&key, &value)))
    })?;

    let store = Arc::clone(&kv);
    ns.add(
        "VSetWithDuration",
        move |_, (key, value, ms): (String, String, u64)| {
            Ok(err_only(store.set_with_duration(&key, &value, Duration::from_millis(ms))))
        },
    )?;

    let store = Arc::clone(&kv);
    ns.add("VGet", move |_, key: String| Ok(store.get(&key)))?;

    let store = kv;
    ns.add("VDel", move |_, key: String| {
        store.delete(&key);
        Ok(())
    })?;
    ns.register()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use crate::libs::testing::vm;

    #[test]
    fn test_set_get_delete() {
        let lua = vm();
        let (err, value, gone): (Option<String>, String, String) = lua
            .load(
                r#"
                local err = kv:VSet("k1", "v1")
                local value = kv:VGet("k1")
                kv:VDel("k1")
                return err, value, kv:VGet("k1")
                "#,
            )
            .eval()
            .unwrap();
        assert!(err.is_none());
        assert_eq!(value, "v1");
        assert_eq!(gone, "");
    }
}
