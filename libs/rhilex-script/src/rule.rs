//! Rule VM: compile the three callbacks and run payloads through them

use std::sync::Arc;

use common::logging::SCRIPT_TARGET;
use errors::RhilexResult;
use mlua::{Function, Lua, MultiValue, Table, Value};
use parking_lot::Mutex;
use rhilex_core::RuleDef;
use tracing::warn;

use crate::env::{ScriptEnv, ScriptScope, VmContext};
use crate::error::{describe, ScriptErrorRecord};
use crate::libs::to_display;
use crate::vm::{load_rule_callbacks, new_vm, verify_rule_syntax};

/// Result of one payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    /// Every action returned truthy and `Success` was called
    Success,
    /// The chain aborted; `Failed` was called with this message
    Failed(String),
    /// The VM was stopped, nothing ran
    Stopped,
}

/// Why the action chain stopped early
struct ChainBreak {
    function_name: String,
    message: String,
    error: Option<mlua::Error>,
}

pub struct RuleVm {
    uuid: String,
    ctx: Arc<VmContext>,
    lua: Mutex<Lua>,
}

impl RuleVm {
    /// Scratch-check `def`, then build its VM and load the callbacks
    pub fn compile(def: &RuleDef, env: ScriptEnv) -> RhilexResult<Self> {
        verify_rule_syntax(def)?;
        let token = env.runtime().root.child_token();
        let ctx = VmContext::new(def.uuid.clone(), ScriptScope::Rule, token, env);
        let lua = new_vm(&ctx)?;
        load_rule_callbacks(&lua, def)?;
        Ok(Self {
            uuid: def.uuid.clone(),
            ctx,
            lua: Mutex::new(lua),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Cancel the VM; a running chain fails at its next instruction
    pub fn stop(&self) {
        self.ctx.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.token.is_cancelled()
    }

    /// Run `payload` through `Actions`, then `Success` or `Failed`.
    ///
    /// Blocks the calling thread; library calls that do I/O drive their
    /// futures on the current tokio runtime, so call this from
    /// `spawn_blocking`.
    pub fn execute(&self, payload: &str) -> RuleOutcome {
        if self.is_stopped() {
            return RuleOutcome::Stopped;
        }
        let lua = self.lua.lock();
        match run_chain(&lua, payload) {
            Ok(()) => {
                if let Err(e) = call_global(&lua, "Success", MultiValue::new()) {
                    self.report("Success", &e);
                }
                RuleOutcome::Success
            },
            Err(brk) => {
                if let Some(e) = &brk.error {
                    self.report(&brk.function_name, e);
                }
                let arg = match lua.create_string(&brk.message) {
                    Ok(s) => MultiValue::from_vec(vec![Value::String(s)]),
                    Err(_) => MultiValue::new(),
                };
                if let Err(e) = call_global(&lua, "Failed", arg) {
                    self.report("Failed", &e);
                }
                RuleOutcome::Failed(brk.message)
            },
        }
    }

    fn report(&self, function_name: &str, e: &mlua::Error) {
        let record = ScriptErrorRecord::from_error(function_name, e);
        warn!(target: SCRIPT_TARGET, topic = %self.ctx.log_topic(), "{}", record);
    }
}

impl Drop for RuleVm {
    fn drop(&mut self) {
        self.ctx.token.cancel();
    }
}

impl std::fmt::Debug for RuleVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleVm")
            .field("uuid", &self.uuid)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn call_global(lua: &Lua, name: &str, args: MultiValue<'_>) -> mlua::Result<()> {
    let f: Function = lua.globals().get(name)?;
    f.call::<_, ()>(args)
}

fn run_chain(lua: &Lua, payload: &str) -> Result<(), ChainBreak> {
    let setup = |e: mlua::Error| ChainBreak {
        function_name: "Actions".to_string(),
        message: describe(&e),
        error: Some(e),
    };
    let actions: Table = lua.globals().get("Actions").map_err(setup)?;
    let mut arg = Value::String(lua.create_string(payload).map_err(setup)?);

    for (i, action) in actions.sequence_values::<Function>().enumerate() {
        let function_name = format!("Actions[{}]", i + 1);
        let fail = |e: mlua::Error| ChainBreak {
            function_name: function_name.clone(),
            message: describe(&e),
            error: Some(e),
        };
        let action = action.map_err(fail)?;
        let ret = action.call::<_, MultiValue>(arg.clone()).map_err(fail)?;
        let mut ret = ret.into_vec().into_iter();
        let first = ret.next().unwrap_or(Value::Nil);
        let second = ret.next();
        match first {
            Value::Nil | Value::Boolean(false) => {
                let message = match second {
                    Some(Value::Nil) | None => format!("{} returned false", function_name),
                    Some(v) => to_display(lua, v)
                        .unwrap_or_else(|_| format!("{} returned false", function_name)),
                };
                return Err(ChainBreak {
                    function_name,
                    message,
                    error: None,
                });
            },
            // (true, data) passes data on; a lone `true` keeps the previous arg
            Value::Boolean(true) => {
                if let Some(next) = second {
                    arg = next;
                }
            },
            // a single non-boolean value is both the verdict and the data
            other => arg = other,
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use common::RhilexConfig;
    use rhilex_core::{RuleStatus, RuntimeContext};

    use super::*;

    fn def(actions: &str) -> RuleDef {
        RuleDef {
            uuid: "rule1".into(),
            name: "r".into(),
            from_source: Some("s1".into()),
            from_device: None,
            actions: actions.into(),
            success: "function Success() successes = (successes or 0) + 1 end".into(),
            failed: "function Failed(err) failures = (failures or 0) + 1; last_error = err end"
                .into(),
            description: String::new(),
            status: RuleStatus::Running,
        }
    }

    fn compile(actions: &str) -> RuleVm {
        let env = ScriptEnv::detached(RuntimeContext::new(RhilexConfig::default()));
        RuleVm::compile(&def(actions), env).unwrap()
    }

    fn global_i64(vm: &RuleVm, name: &str) -> i64 {
        vm.lua.lock().globals().get::<_, Option<i64>>(name).unwrap().unwrap_or(0)
    }

    #[test]
    fn test_chain_passes_data_along() {
        let vm = compile(
            r#"
            Actions = {
                function(args) return true, args .. "-1" end,
                function(args) return true end,
                function(args) seen = args; return true, args end,
            }
            "#,
        );
        assert_eq!(vm.execute("x"), RuleOutcome::Success);
        let seen: String = vm.lua.lock().globals().get("seen").unwrap();
        assert_eq!(seen, "x-1");
        assert_eq!(global_i64(&vm, "successes"), 1);
        assert_eq!(global_i64(&vm, "failures"), 0);
    }

    #[test]
    fn test_false_return_short_circuits() {
        let vm = compile(
            r#"
            Actions = {
                function(args) return true, args end,
                function(args) return false, "bad reading" end,
                function(args) third = true; return true, args end,
            }
            "#,
        );
        assert_eq!(vm.execute("x"), RuleOutcome::Failed("bad reading".into()));
        assert_eq!(global_i64(&vm, "failures"), 1);
        assert_eq!(global_i64(&vm, "successes"), 0);
        let third: Option<bool> = vm.lua.lock().globals().get("third").unwrap();
        assert!(third.is_none());
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_error_is_reported_with_record() {
        let vm = compile("Actions = { function(args) error('boom') end }");
        match vm.execute("x") {
            RuleOutcome::Failed(msg) => assert!(msg.contains("boom")),
            other => panic!("unexpected outcome {other:?}"),
        }
        let last: String = vm.lua.lock().globals().get("last_error").unwrap();
        assert!(last.contains("boom"));
        assert!(logs_contain("Function Name: [Actions[1]]"));
        assert!(logs_contain("rule/log/rule1"));
    }

    #[test]
    fn test_stopped_vm_runs_nothing() {
        let vm = compile("Actions = { function(args) ran = true; return true, args end }");
        vm.stop();
        assert_eq!(vm.execute("x"), RuleOutcome::Stopped);
        let ran: Option<bool> = vm.lua.lock().globals().get("ran").unwrap();
        assert!(ran.is_none());
    }

    #[test]
    fn test_cancel_interrupts_busy_loop() {
        let vm = Arc::new(compile("Actions = { function(args) while true do end end }"));
        let stopper = Arc::clone(&vm);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(50));
            stopper.stop();
        });
        match vm.execute("x") {
            RuleOutcome::Failed(msg) => assert!(msg.contains(crate::VM_CANCELLED)),
            other => panic!("unexpected outcome {other:?}"),
        }
        handle.join().unwrap();
    }
}
