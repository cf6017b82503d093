/// Embedded Lua scripting for conditions, expressions and automation chains
///
/// Every evaluation gets a fresh sandboxed interpreter: `os`, `io`, `debug`,
/// `package` and the file loaders are removed, and safe `date(fmt)`, `time()` and
/// `now()` helpers are provided instead. The expression scope is exposed as Lua
/// globals (`WorkflowVariables`, `NodeVariables`, `nodeId`, `documents`, ...).
///
/// Automation chains are named Lua scripts. A chain mutates the
/// `WorkflowVariables` / `NodeVariables` tables in place; whatever changed is handed
/// back to the engine as [`VariableChanges`].

use crate::{
    error::CollaboratorError,
    runtime::collaborators::{ChainExecutor, ExpressionEvaluator, NodeContext, VariableChanges},
    workflow::types::Variables,
};
use arc_swap::ArcSwap;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

/// Lua-backed [`ExpressionEvaluator`] and [`ChainExecutor`]
#[derive(Debug)]
pub struct LuaScripting {
    chains: ArcSwap<HashMap<String, String>>,
}

impl Default for LuaScripting {
    fn default() -> Self {
        Self::new()
    }
}

impl LuaScripting {
    pub fn new() -> Self {
        Self::with_chains(HashMap::new())
    }

    pub fn with_chains(chains: HashMap<String, String>) -> Self {
        Self {
            chains: ArcSwap::new(Arc::new(chains)),
        }
    }

    /// Register or replace a chain; visible to the next evaluation
    pub fn register_chain(&self, chain_id: impl Into<String>, script: impl Into<String>) {
        let chain_id = chain_id.into();
        let script = script.into();
        self.chains.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(chain_id.clone(), script.clone());
            next
        });
        tracing::debug!("📝 Registered automation chain: {}", chain_id);
    }

    pub fn chain_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chains.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn script(&self, chain_id: &str) -> Option<String> {
        self.chains.load().get(chain_id).cloned()
    }
}

impl ExpressionEvaluator for LuaScripting {
    fn evaluate(&self, expression: &str, scope: &Value) -> Result<Value, CollaboratorError> {
        let lua = sandbox().map_err(script_error)?;
        expose_scope(&lua, scope).map_err(script_error)?;

        let result = lua
            .load(expression)
            .eval::<mlua::Value>()
            .map_err(script_error)?;
        lua_to_json(result)
    }
}

impl ChainExecutor for LuaScripting {
    fn execute_chain(
        &self,
        chain_id: &str,
        context: &NodeContext,
    ) -> Result<VariableChanges, CollaboratorError> {
        let script = self
            .script(chain_id)
            .ok_or_else(|| CollaboratorError::UnknownChain(chain_id.to_string()))?;

        tracing::debug!("⚙️ Running chain {} on node {}", chain_id, context.node_id);

        let lua = sandbox().map_err(script_error)?;
        let scope = context.scope();
        expose_scope(&lua, &scope).map_err(script_error)?;
        // Chains see the raw node scope, without the computed task counters
        let globals = lua.globals();
        globals
            .set(
                "NodeVariables",
                json_to_lua(&lua, &Value::Object(context.node_variables.clone()))
                    .map_err(script_error)?,
            )
            .map_err(script_error)?;

        lua.load(script.as_str()).exec().map_err(script_error)?;

        let workflow_after = read_table(&globals, "WorkflowVariables")?;
        let node_after = read_table(&globals, "NodeVariables")?;

        Ok(VariableChanges {
            workflow: changed_entries(&context.workflow_variables, workflow_after),
            node: changed_entries(&context.node_variables, node_after),
        })
    }
}

fn script_error(e: mlua::Error) -> CollaboratorError {
    CollaboratorError::Script(e.to_string())
}

/// Fresh interpreter with dangerous globals removed and time helpers installed
fn sandbox() -> mlua::Result<mlua::Lua> {
    let lua = mlua::Lua::new();
    {
        let globals = lua.globals();

        globals.set(
            "date",
            lua.create_function(|_, format: String| Ok(chrono::Utc::now().format(&format).to_string()))?,
        )?;
        globals.set(
            "time",
            lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?,
        )?;
        globals.set(
            "now",
            lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?,
        )?;

        for name in ["os", "io", "debug", "package", "require", "dofile", "loadfile"] {
            globals.set(name, mlua::Nil)?;
        }
    }
    Ok(lua)
}

fn expose_scope(lua: &mlua::Lua, scope: &Value) -> mlua::Result<()> {
    let globals = lua.globals();
    if let Value::Object(entries) = scope {
        for (key, value) in entries {
            globals.set(key.as_str(), json_to_lua(lua, value)?)?;
        }
    }
    Ok(())
}

fn read_table(globals: &mlua::Table, name: &str) -> Result<Variables, CollaboratorError> {
    let value: mlua::Value = globals.get(name).map_err(script_error)?;
    match lua_to_json(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Variables::new()),
        _ => Err(CollaboratorError::Script(format!("{} must remain a table", name))),
    }
}

/// Entries of `after` that are new or differ from `before`
fn changed_entries(before: &Variables, after: Variables) -> Variables {
    after
        .into_iter()
        .filter(|(key, value)| match before.get(key) {
            Some(old) => old != value && !(is_empty_container(old) && is_empty_container(value)),
            None => true,
        })
        .collect()
}

// Lua cannot tell `{}` from `[]`, so an untouched empty list comes back as an object.
fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn json_to_lua(lua: &mlua::Lua, value: &Value) -> mlua::Result<mlua::Value> {
    Ok(match value {
        Value::Null => mlua::Value::Nil,
        Value::Bool(b) => mlua::Value::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => mlua::Value::Integer(i),
            None => mlua::Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => mlua::Value::String(lua.create_string(s)?),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (position, item) in items.iter().enumerate() {
                table.raw_set(position + 1, json_to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
        Value::Object(entries) => {
            let table = lua.create_table()?;
            for (key, item) in entries {
                table.raw_set(key.as_str(), json_to_lua(lua, item)?)?;
            }
            mlua::Value::Table(table)
        }
    })
}

fn lua_to_json(value: mlua::Value) -> Result<Value, CollaboratorError> {
    match value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::from(i)),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        mlua::Value::String(s) => {
            let text = s
                .to_str()
                .map_err(|e| CollaboratorError::Script(format!("invalid UTF-8 in Lua string: {}", e)))?;
            Ok(Value::String(text.to_string()))
        }
        mlua::Value::Table(table) => {
            let mut max_index = 0usize;
            let mut count = 0usize;
            let mut is_array = true;
            for pair in table.clone().pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair.map_err(script_error)?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => is_array = false,
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut items = Vec::with_capacity(count);
                for position in 1..=max_index {
                    let item: mlua::Value = table.raw_get(position).map_err(script_error)?;
                    items.push(lua_to_json(item)?);
                }
                return Ok(Value::Array(items));
            }

            let mut map = serde_json::Map::new();
            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, item) = pair.map_err(script_error)?;
                let key = match key {
                    mlua::Value::String(s) => s
                        .to_str()
                        .map_err(|e| CollaboratorError::Script(format!("invalid UTF-8 in Lua key: {}", e)))?
                        .to_string(),
                    mlua::Value::Integer(i) => i.to_string(),
                    _ => continue,
                };
                map.insert(key, lua_to_json(item)?);
            }
            Ok(Value::Object(map))
        }
        _ => Ok(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(workflow: Value, node: Value) -> NodeContext {
        NodeContext {
            instance_id: "i1".into(),
            model_id: "m".into(),
            node_id: "review".into(),
            node_state: "running_output".into(),
            initiator: "alice".into(),
            documents: vec!["doc-1".into()],
            parent: None,
            workflow_variables: workflow.as_object().cloned().unwrap_or_default(),
            node_variables: node.as_object().cloned().unwrap_or_default(),
            button: Some("approve".into()),
            last_actor: Some("bob".into()),
            transition: None,
            number_of_tasks: 1,
            number_of_processed_tasks: 1,
        }
    }

    #[test]
    fn conditions_read_scope_variables() {
        let lua = LuaScripting::new();
        let scope = context(json!({"amount": 250}), json!({})).scope();

        assert!(lua.evaluate_condition("WorkflowVariables.amount > 100", &scope).unwrap());
        assert!(lua.evaluate_condition("NodeVariables.button == 'approve'", &scope).unwrap());
        assert!(!lua.evaluate_condition("nodeId == 'other'", &scope).unwrap());
    }

    #[test]
    fn non_boolean_condition_is_rejected() {
        let lua = LuaScripting::new();
        let err = lua.evaluate_condition("'yes'", &json!({})).unwrap_err();
        assert_eq!(err, CollaboratorError::NotBoolean("'yes'".into()));
    }

    #[test]
    fn value_expressions_convert_tables() {
        let lua = LuaScripting::new();
        let scope = json!({"WorkflowVariables": {"reviewers": ["bob", "carol"]}});
        assert_eq!(
            lua.evaluate("WorkflowVariables.reviewers", &scope).unwrap(),
            json!(["bob", "carol"])
        );
        assert_eq!(lua.evaluate("{a = 1}", &scope).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn sandbox_removes_os_access() {
        let lua = LuaScripting::new();
        assert!(matches!(
            lua.evaluate("os.time()", &json!({})),
            Err(CollaboratorError::Script(_))
        ));
        assert!(lua.evaluate("time()", &json!({})).unwrap().is_i64());
    }

    #[test]
    fn chain_reports_changed_variables_only() {
        let lua = LuaScripting::new();
        lua.register_chain(
            "bump",
            "WorkflowVariables.round = WorkflowVariables.round + 1\nNodeVariables.note = nodeId",
        );

        let changes = lua
            .execute_chain("bump", &context(json!({"round": 1, "tags": []}), json!({})))
            .unwrap();
        assert_eq!(changes.workflow, json!({"round": 2}).as_object().cloned().unwrap());
        assert_eq!(changes.node, json!({"note": "review"}).as_object().cloned().unwrap());
    }

    #[test]
    fn unknown_chain_is_an_error() {
        let lua = LuaScripting::new();
        let err = lua.execute_chain("missing", &context(json!({}), json!({}))).unwrap_err();
        assert_eq!(err, CollaboratorError::UnknownChain("missing".into()));
    }
}
