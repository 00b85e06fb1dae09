//! Parameter expression evaluation.
//!
//! A parameter string starting with `=` is an expression. The remainder is a
//! minijinja template; when it consists of a single `{{ ... }}` block the
//! expression is evaluated to a typed JSON value, otherwise the template is
//! rendered to a string. Evaluation is side-effect free: the same expression
//! against the same run state always yields the same value.

use crate::registry::ItemMode;
use flowcore::{
    CredentialError, CredentialProvider, ExpressionError, Item, ItemSet, Parameters, RunContext,
    RunState, Workflow, MAIN_PORT,
};
use minijinja::value::{Object, Value as TemplateValue};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

const EXPRESSION_PREFIX: char = '=';

/// Everything an expression can see while resolving one node invocation
pub struct ExpressionContext<'a> {
    pub run: &'a RunState,
    pub workflow: &'a Workflow,
    pub node: &'a str,
    pub run_index: usize,
    /// Items on the node's primary input port
    pub input: &'a ItemSet,
    pub run_context: &'a RunContext,
}

pub struct ExpressionResolver {
    env: Environment<'static>,
    variables: BTreeMap<String, String>,
    credentials: Arc<dyn CredentialProvider>,
}

impl ExpressionResolver {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            env,
            variables: BTreeMap::new(),
            credentials,
        }
    }

    /// Variables exposed to expressions as `env`
    pub fn with_variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// True for a string value that should be evaluated
    pub fn is_expression(value: &Value) -> bool {
        matches!(value, Value::String(s) if s.starts_with(EXPRESSION_PREFIX))
    }

    /// Resolve a single `=`-prefixed expression for the item at `item_index`
    /// of the context's input. Plain strings are returned unchanged.
    pub fn resolve(
        &self,
        expression: &str,
        ctx: &ExpressionContext<'_>,
        item_index: usize,
    ) -> Result<Value, ExpressionError> {
        let scope = self.scope(ctx);
        self.evaluate(expression, &scope, item_index)
    }

    /// Resolve a node's raw parameters. `PerItem` yields one evaluation per
    /// input item (at least one, so nodes without input still get values).
    pub fn resolve_parameters(
        &self,
        raw: &Map<String, Value>,
        ctx: &ExpressionContext<'_>,
        mode: ItemMode,
    ) -> Result<Parameters, ExpressionError> {
        let evaluations = match mode {
            ItemMode::Once => 1,
            ItemMode::PerItem => ctx.input.len().max(1),
        };

        if !raw.values().any(contains_expression) {
            return Ok(match mode {
                ItemMode::Once => Parameters::Once(raw.clone()),
                ItemMode::PerItem => Parameters::PerItem(vec![raw.clone(); evaluations]),
            });
        }

        let scope = self.scope(ctx);
        let mut resolved = Vec::with_capacity(evaluations);
        for index in 0..evaluations {
            let mut params = Map::new();
            for (key, value) in raw {
                params.insert(key.clone(), self.resolve_value(value, &scope, index)?);
            }
            resolved.push(params);
        }

        Ok(match mode {
            ItemMode::Once => Parameters::Once(resolved.into_iter().next().unwrap_or_default()),
            ItemMode::PerItem => Parameters::PerItem(resolved),
        })
    }

    fn resolve_value(
        &self,
        value: &Value,
        scope: &Scope<'_>,
        index: usize,
    ) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) if s.starts_with(EXPRESSION_PREFIX) => self.evaluate(s, scope, index),
            Value::Array(values) => values
                .iter()
                .map(|v| self.resolve_value(v, scope, index))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_value(v, scope, index)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn evaluate(
        &self,
        expression: &str,
        scope: &Scope<'_>,
        index: usize,
    ) -> Result<Value, ExpressionError> {
        let Some(body) = expression.strip_prefix(EXPRESSION_PREFIX) else {
            return Ok(Value::String(expression.to_string()));
        };
        let context = scope.for_item(index);

        let result = match single_block(body) {
            Some(inner) => self
                .env
                .compile_expression(inner)
                .and_then(|compiled| compiled.eval(&context))
                .map_err(|e| map_error(expression, e))
                .and_then(|value| {
                    if value.is_undefined() {
                        return Err(ExpressionError::Unresolved {
                            expression: expression.to_string(),
                        });
                    }
                    serde_json::to_value(&value).map_err(|e| ExpressionError::TypeMismatch {
                        expression: expression.to_string(),
                        message: e.to_string(),
                    })
                }),
            None => self
                .env
                .render_str(body, &context)
                .map(Value::String)
                .map_err(|e| map_error(expression, e)),
        };

        if let Some(name) = scope.take_credential_failure() {
            return Err(ExpressionError::CredentialNotFound { name });
        }
        result
    }

    fn scope<'a>(&self, ctx: &'a ExpressionContext<'a>) -> Scope<'a> {
        let failure = Arc::new(Mutex::new(None));
        let mut base = BTreeMap::new();

        base.insert("nodes".to_string(), TemplateValue::from_serialize(node_outputs(ctx.run)));
        base.insert(
            "workflow".to_string(),
            TemplateValue::from_serialize(json!({
                "id": ctx.workflow.id,
                "name": ctx.workflow.name,
                "timezone": ctx.workflow.settings.timezone,
            })),
        );
        base.insert(
            "execution".to_string(),
            TemplateValue::from_serialize(json!({
                "id": ctx.run.run_id,
                "mode": ctx.run.mode,
            })),
        );
        base.insert(
            "static_data".to_string(),
            TemplateValue::from_serialize(&ctx.run.static_data),
        );
        base.insert("env".to_string(), TemplateValue::from_serialize(&self.variables));
        base.insert("run_index".to_string(), TemplateValue::from(ctx.run_index));
        base.insert(
            "credentials".to_string(),
            TemplateValue::from_object(CredentialLookup {
                provider: self.credentials.clone(),
                run: ctx.run_context.clone(),
                failure: failure.clone(),
            }),
        );

        Scope {
            base,
            input: ctx.input,
            all: TemplateValue::from_serialize(ctx.input.json_values()),
            failure,
        }
    }
}

/// Context shared by all items of one node invocation
struct Scope<'a> {
    base: BTreeMap<String, TemplateValue>,
    input: &'a ItemSet,
    all: TemplateValue,
    failure: Arc<Mutex<Option<CredentialError>>>,
}

impl Scope<'_> {
    fn for_item(&self, index: usize) -> TemplateValue {
        let item = self.input.get(index);
        let json = item.map(|i| Value::Object(i.json.clone())).unwrap_or_else(|| json!({}));
        let first = self
            .input
            .first()
            .map(|i| Value::Object(i.json.clone()))
            .unwrap_or(Value::Null);

        let mut vars = self.base.clone();
        vars.insert("json".to_string(), TemplateValue::from_serialize(&json));
        vars.insert("binary".to_string(), TemplateValue::from_serialize(binary_metadata(item)));
        vars.insert("item_index".to_string(), TemplateValue::from(index));
        vars.insert(
            "input".to_string(),
            TemplateValue::from(BTreeMap::from([
                ("item", TemplateValue::from_serialize(&json)),
                ("all", self.all.clone()),
                ("first", TemplateValue::from_serialize(&first)),
            ])),
        );
        TemplateValue::from(vars)
    }

    fn take_credential_failure(&self) -> Option<String> {
        let mut slot = self.failure.lock().ok()?;
        slot.take().map(|err| match err {
            CredentialError::NotFound(name) | CredentialError::Unavailable { name, .. } => name,
        })
    }
}

/// Lazily resolves `credentials.<name>` through the provider
struct CredentialLookup {
    provider: Arc<dyn CredentialProvider>,
    run: RunContext,
    failure: Arc<Mutex<Option<CredentialError>>>,
}

impl fmt::Debug for CredentialLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<credentials>")
    }
}

impl Object for CredentialLookup {
    fn get_value(self: &Arc<Self>, key: &TemplateValue) -> Option<TemplateValue> {
        let name = key.as_str()?;
        match self.provider.resolve_credential(name, &self.run) {
            Ok(data) => Some(TemplateValue::from_serialize(&data)),
            Err(err) => {
                if let Ok(mut slot) = self.failure.lock() {
                    slot.get_or_insert(err);
                }
                None
            }
        }
    }
}

fn contains_expression(value: &Value) -> bool {
    match value {
        Value::String(s) => s.starts_with(EXPRESSION_PREFIX),
        Value::Array(values) => values.iter().any(contains_expression),
        Value::Object(map) => map.values().any(contains_expression),
        _ => false,
    }
}

/// Inner expression of a template made of exactly one `{{ ... }}` block
fn single_block(body: &str) -> Option<&str> {
    let inner = body.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn map_error(expression: &str, err: minijinja::Error) -> ExpressionError {
    let expression = expression.to_string();
    match err.kind() {
        ErrorKind::UndefinedError => ExpressionError::Unresolved { expression },
        ErrorKind::InvalidOperation
        | ErrorKind::NonPrimitive
        | ErrorKind::NonKey
        | ErrorKind::CannotUnpack => ExpressionError::TypeMismatch {
            expression,
            message: err.to_string(),
        },
        _ => ExpressionError::Syntax {
            expression,
            message: err.to_string(),
        },
    }
}

/// Latest output of every executed node, shaped for `nodes.<name>`
fn node_outputs(run: &RunState) -> Value {
    let mut nodes = Map::new();
    for (name, runs) in &run.run_data {
        let Some(last) = runs.last() else { continue };
        let primary = last
            .outputs
            .get(MAIN_PORT)
            .or_else(|| last.outputs.values().next());
        let items = primary.map(ItemSet::json_values).unwrap_or_default();
        let output: Map<String, Value> = last
            .outputs
            .iter()
            .map(|(port, set)| (port.clone(), Value::Array(set.json_values())))
            .collect();

        nodes.insert(
            name.clone(),
            json!({
                "json": items.first().cloned().unwrap_or_else(|| json!({})),
                "items": items,
                "output": output,
                "runs": runs.len(),
            }),
        );
    }
    Value::Object(nodes)
}

/// Binary attachments without their payload
fn binary_metadata(item: Option<&Item>) -> Value {
    let mut out = Map::new();
    if let Some(item) = item {
        for (name, data) in &item.binary {
            out.insert(
                name.clone(),
                json!({
                    "mime_type": data.mime_type,
                    "file_name": data.file_name,
                    "size": data.data.len(),
                }),
            );
        }
    }
    Value::Object(out)
}
