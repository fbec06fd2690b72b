//! Record transformation through a user-supplied Rhai script.
//!
//! The script sees the current row as the `record` variable and must evaluate
//! to a map, which replaces the row:
//!
//! ```rhai
//! record.remove("password");
//! record.full_name = record.first + " " + record.last;
//! record
//! ```

use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::source::Record;

/// Maps one record to another.
pub trait Transformer: Send + Sync {
    /// Applies the transformation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transform`] if the transformation fails or produces
    /// something other than a key-value mapping.
    fn apply(&self, record: Record) -> Result<Record>;
}

impl<F> Transformer for F
where
    F: Fn(Record) -> Result<Record> + Send + Sync,
{
    fn apply(&self, record: Record) -> Result<Record> {
        self(record)
    }
}

/// Transformer backed by a compiled Rhai script.
pub struct ScriptTransformer {
    engine: Engine,
    ast: AST,
}

impl std::fmt::Debug for ScriptTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptTransformer").finish_non_exhaustive()
    }
}

impl ScriptTransformer {
    /// Compiles a script from source text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the script does not compile.
    pub fn from_script(script: &str) -> Result<Self> {
        let engine = create_engine();
        let ast = engine
            .compile(script)
            .map_err(|e| Error::Config(format!("script compilation failed: {}", e)))?;
        Ok(Self { engine, ast })
    }

    /// Reads and compiles a script file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not compile.
    pub fn from_file(path: &Path) -> Result<Self> {
        let script = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read script '{}': {}", path.display(), e))
        })?;
        let transformer = Self::from_script(&script)?;
        debug!(path = %path.display(), "Loaded transform script");
        Ok(transformer)
    }
}

/// Creates a Rhai engine with safety limits.
fn create_engine() -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(1_000_000);
    engine.set_max_string_size(10_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(100_000);
    engine.set_max_call_levels(32);
    engine.set_optimization_level(rhai::OptimizationLevel::Full);

    engine
}

/// Fails on integers outside `i64`, which Rhai would turn into floats.
fn check_integer_range(field: &str, value: &Value) -> Result<()> {
    match value {
        Value::Number(n) if n.is_u64() && n.as_i64().is_none() => Err(Error::Transform(format!(
            "field '{}' holds {} which does not fit a script integer",
            field, n
        ))),
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| check_integer_range(field, item)),
        Value::Object(map) => map
            .values()
            .try_for_each(|item| check_integer_range(field, item)),
        _ => Ok(()),
    }
}

impl Transformer for ScriptTransformer {
    fn apply(&self, record: Record) -> Result<Record> {
        for (field, value) in &record {
            check_integer_range(field, value)?;
        }

        let input = rhai::serde::to_dynamic(&record)
            .map_err(|e| Error::Transform(format!("cannot pass record to script: {}", e)))?;

        let mut scope = Scope::new();
        scope.push_dynamic("record", input);

        let result: Dynamic = self
            .engine
            .eval_ast_with_scope(&mut scope, &self.ast)
            .map_err(|e| Error::Transform(format!("script execution failed: {}", e)))?;

        if !result.is_map() {
            return Err(Error::Transform(format!(
                "script must return a map, got {}",
                result.type_name()
            )));
        }

        rhai::serde::from_dynamic::<Record>(&result)
            .map_err(|e| Error::Transform(format!("invalid script result: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn test_remove_field() {
        let transformer = ScriptTransformer::from_script(r#"record.remove("secret"); record"#).unwrap();

        let out = transformer
            .apply(record(json!({"id": 1, "name": "a", "secret": "x"})))
            .unwrap();

        assert_eq!(out, record(json!({"id": 1, "name": "a"})));
    }

    #[test]
    fn test_new_map_result() {
        let transformer =
            ScriptTransformer::from_script(r#"#{ user: record.name, tags: [1, 2], meta: #{ ok: true } }"#)
                .unwrap();

        let out = transformer.apply(record(json!({"name": "bob"}))).unwrap();

        assert_eq!(
            out,
            record(json!({"user": "bob", "tags": [1, 2], "meta": {"ok": true}}))
        );
    }

    #[test]
    fn test_preserves_value_types() {
        let transformer = ScriptTransformer::from_script("record").unwrap();
        let input = record(json!({"i": 7, "f": 1.5, "b": false, "n": null, "s": "x"}));

        let out = transformer.apply(input.clone()).unwrap();

        assert_eq!(out, input);
    }

    #[test]
    fn test_non_map_result_is_transform_error() {
        let transformer = ScriptTransformer::from_script("42").unwrap();

        let err = transformer.apply(record(json!({"id": 1}))).unwrap_err();

        assert!(matches!(err, Error::Transform(_)));
        assert!(err.to_string().contains("must return a map"));
    }

    #[test]
    fn test_integer_beyond_i64_is_rejected() {
        let transformer = ScriptTransformer::from_script("record").unwrap();

        let err = transformer
            .apply(record(json!({"id": u64::MAX})))
            .unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
        assert!(err.to_string().contains("'id'"));

        let err = transformer
            .apply(record(json!({"ids": [1, u64::MAX]})))
            .unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn test_integer_at_i64_bounds_passes_unchanged() {
        let transformer = ScriptTransformer::from_script("record").unwrap();
        let input = record(json!({"max": i64::MAX, "min": i64::MIN, "nested": {"n": i64::MAX}}));

        let out = transformer.apply(input.clone()).unwrap();

        assert_eq!(out, input);
    }

    #[test]
    fn test_runtime_error_is_transform_error() {
        let transformer = ScriptTransformer::from_script(r#"throw "boom""#).unwrap();

        let err = transformer.apply(record(json!({}))).unwrap_err();

        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn test_compile_error_is_config_error() {
        let err = ScriptTransformer::from_script("record.").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = ScriptTransformer::from_file(Path::new("/nonexistent/script.rhai")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
