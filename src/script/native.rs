//! The one script environment the core ships: a JSON-native backend used by
//! tests and in-process examples. Real language backends (Ale, Lua, JPath)
//! are external collaborators implementing [`super::ScriptEnvironment`].

use serde_json::Value;

use super::{Compiled, ScriptEnvironment, ScriptError};
use crate::model::Args;

/// Either a literal JSON value, or a reference to one named input.
#[derive(Debug, Clone)]
pub enum CompiledNative {
    Literal(Value),
    InputRef(String),
}

fn parse(source: &str) -> Result<CompiledNative, ScriptError> {
    let trimmed = source.trim();
    if let Some(name) = trimmed.strip_prefix('$') {
        if name.is_empty() {
            return Err(ScriptError::Compile("empty input reference".into()));
        }
        return Ok(CompiledNative::InputRef(name.to_string()));
    }
    serde_json::from_str::<Value>(trimmed)
        .map(CompiledNative::Literal)
        .map_err(|e| ScriptError::Compile(e.to_string()))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        _ => true,
    }
}

pub struct NativeEnvironment;

impl ScriptEnvironment for NativeEnvironment {
    fn validate(&self, source: &str) -> Result<(), ScriptError> {
        parse(source).map(|_| ())
    }

    fn compile(&self, source: &str, _arg_names: &[String]) -> Result<Compiled, ScriptError> {
        Ok(Compiled::new(parse(source)?))
    }

    fn execute_script(&self, compiled: &Compiled, inputs: &Args) -> Result<Args, ScriptError> {
        let native = compiled
            .downcast_ref::<CompiledNative>()
            .ok_or_else(|| ScriptError::Execute("wrong environment for this script".into()))?;
        let value = match native {
            CompiledNative::Literal(v) => v.clone(),
            CompiledNative::InputRef(name) => inputs.get(name).cloned().unwrap_or(Value::Null),
        };
        let mut out = Args::new();
        out.insert("value".to_string(), value);
        Ok(out)
    }

    fn evaluate_predicate(&self, compiled: &Compiled, inputs: &Args) -> Result<bool, ScriptError> {
        let native = compiled
            .downcast_ref::<CompiledNative>()
            .ok_or_else(|| ScriptError::Execute("wrong environment for this script".into()))?;
        let value = match native {
            CompiledNative::Literal(v) => v.clone(),
            CompiledNative::InputRef(name) => inputs.get(name).cloned().unwrap_or(Value::Null),
        };
        Ok(is_truthy(&value))
    }
}
