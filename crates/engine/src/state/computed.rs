//! Computed-field dependency graph and recomputation.
//!
//! Descriptors form a DAG keyed by output name; edges point from a field to
//! the computed fields it reads. The graph is built once at `initialize`,
//! where cycles are rejected, transforms are compiled, and a topological
//! order is fixed. Recomputation after an update batch walks that order,
//! recomputing only fields whose transitive dependencies intersect the
//! changed paths.

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{debug, warn};
use windlass_types::{ComputedErrorPolicy, ComputedFieldDefinition, ErrorCode, WorkflowError};

use crate::expr::{CompiledExpr, JsValue, Scope, compile};

/// A compiled computed field: dependencies plus its transform.
#[derive(Debug, Clone)]
struct CompiledField {
    name: String,
    dependencies: Vec<String>,
    dependencies_are_list: bool,
    transform: CompiledExpr,
    on_error: ComputedErrorPolicy,
    fallback: Option<JsonValue>,
}

/// The computed tier's dependency graph, fixed at initialization.
#[derive(Debug, Clone, Default)]
pub struct ComputedGraph {
    /// Fields in topological order (dependencies first).
    fields: Vec<CompiledField>,
}

impl ComputedGraph {
    /// Builds the graph from a schema, compiling transforms and ordering
    /// fields topologically. A dependency cycle is a load-time
    /// `CIRCULAR_DEPENDENCY` error naming the members.
    pub fn build(schema: &IndexMap<String, ComputedFieldDefinition>) -> Result<Self, WorkflowError> {
        let mut unordered = IndexMap::new();
        for (name, definition) in schema {
            let transform = compile(&definition.transform).map_err(|error| {
                WorkflowError::new(
                    ErrorCode::ExpressionError,
                    format!("computed field '{name}' transform does not compile: {error}"),
                )
                .with_path(format!("computed.{name}"))
            })?;
            unordered.insert(
                name.clone(),
                CompiledField {
                    name: name.clone(),
                    dependencies: definition.from.paths().iter().map(|path| path.to_string()).collect(),
                    dependencies_are_list: definition.from.is_many(),
                    transform,
                    on_error: definition.on_error,
                    fallback: definition.fallback.clone(),
                },
            );
        }

        let order = topological_order(&unordered)?;
        let fields = order
            .into_iter()
            .map(|name| unordered.get(&name).expect("ordered names come from the map").clone())
            .collect();
        Ok(Self { fields })
    }

    /// True when the schema declared no computed fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Recomputes fields affected by `changed_paths` (all fields when `None`),
    /// reading dependencies from the evolving flattened view and writing
    /// results into `computed`.
    ///
    /// On a transform failure the field's `on_error` policy applies:
    /// `propagate` fails the call (and with it the enclosing batch),
    /// `use_fallback` substitutes the configured fallback, `ignore` keeps the
    /// prior value.
    pub fn recompute(
        &self,
        inputs: &JsonMap<String, JsonValue>,
        state: &JsonMap<String, JsonValue>,
        computed: &mut JsonMap<String, JsonValue>,
        changed_paths: Option<&[String]>,
    ) -> Result<Vec<String>, WorkflowError> {
        let mut dirty: IndexSet<String> = changed_paths.map(|paths| paths.iter().cloned().collect()).unwrap_or_default();
        let recompute_all = changed_paths.is_none();
        let mut recomputed = Vec::new();

        for field in &self.fields {
            let affected = recompute_all
                || field
                    .dependencies
                    .iter()
                    .any(|dependency| dirty.iter().any(|changed| paths_overlap(dependency, changed)));
            if !affected {
                continue;
            }

            let flattened = flatten_tiers(inputs, state, computed);
            let mut scope = Scope::from_flattened(&scope_maps(inputs, state, computed));
            scope.bind("input", dependency_input(field, &flattened));

            match field.transform.evaluate(&scope) {
                Ok(value) => {
                    computed.insert(field.name.clone(), value.into_json());
                }
                Err(evaluation_error) => match field.on_error {
                    ComputedErrorPolicy::Propagate => {
                        return Err(WorkflowError::new(
                            ErrorCode::ExpressionError,
                            format!("computed field '{}' failed: {evaluation_error}", field.name),
                        )
                        .with_path(format!("computed.{}", field.name)));
                    }
                    ComputedErrorPolicy::UseFallback => {
                        warn!(field = %field.name, error = %evaluation_error, "computed field failed; using fallback");
                        computed.insert(field.name.clone(), field.fallback.clone().unwrap_or(JsonValue::Null));
                    }
                    ComputedErrorPolicy::Ignore => {
                        warn!(field = %field.name, error = %evaluation_error, "computed field failed; keeping prior value");
                    }
                },
            }

            dirty.insert(format!("computed.{}", field.name));
            recomputed.push(field.name.clone());
        }

        if !recomputed.is_empty() {
            debug!(fields = ?recomputed, "recomputed fields");
        }
        Ok(recomputed)
    }
}

/// Binds the transform's `input`: the dependency value, or the ordered array
/// of values when the descriptor declared a list.
fn dependency_input(field: &CompiledField, flattened: &JsonMap<String, JsonValue>) -> JsValue {
    let mut values: Vec<JsValue> = field
        .dependencies
        .iter()
        .map(|dependency| read_flattened_path(flattened, dependency))
        .collect();
    if field.dependencies_are_list {
        JsValue::Array(values)
    } else {
        values.drain(..).next().unwrap_or(JsValue::Undefined)
    }
}

/// Reads a dotted dependency path against the flattened view. Tier prefixes
/// (`state.`, `inputs.`, `computed.`, legacy `raw.`) address the flattened
/// keys directly; unprefixed paths resolve as authored.
fn read_flattened_path(flattened: &JsonMap<String, JsonValue>, path: &str) -> JsValue {
    let normalized = path.strip_prefix("raw.").map(|rest| format!("state.{rest}"));
    let effective: &str = normalized.as_deref().unwrap_or(path);

    let stripped = effective
        .strip_prefix("state.")
        .or_else(|| effective.strip_prefix("inputs."))
        .or_else(|| effective.strip_prefix("computed."))
        .unwrap_or(effective);

    let mut segments = stripped.split('.');
    let first = match segments.next() {
        Some(first) if !first.is_empty() => first,
        _ => return JsValue::Undefined,
    };
    let Some(mut current) = flattened.get(first) else {
        return JsValue::Undefined;
    };
    for segment in segments {
        match current.as_object().and_then(|map| map.get(segment)) {
            Some(next) => current = next,
            None => return JsValue::Undefined,
        }
    }
    JsValue::from_json(current)
}

/// Projects the three tiers into a flattened scope with precedence
/// `computed > state > inputs`.
pub fn flatten_tiers(
    inputs: &JsonMap<String, JsonValue>,
    state: &JsonMap<String, JsonValue>,
    computed: &JsonMap<String, JsonValue>,
) -> JsonMap<String, JsonValue> {
    let mut flattened = JsonMap::new();
    for (key, value) in inputs {
        flattened.insert(key.clone(), value.clone());
    }
    for (key, value) in state {
        flattened.insert(key.clone(), value.clone());
    }
    for (key, value) in computed {
        flattened.insert(key.clone(), value.clone());
    }
    flattened
}

/// The full expression scope: flattened keys at the top level plus the tier
/// objects themselves, so both `{{ counter }}` and `{{ state.counter }}`
/// (and the legacy `{{ raw.counter }}`) resolve.
pub fn scope_maps(
    inputs: &JsonMap<String, JsonValue>,
    state: &JsonMap<String, JsonValue>,
    computed: &JsonMap<String, JsonValue>,
) -> JsonMap<String, JsonValue> {
    let mut scope = flatten_tiers(inputs, state, computed);
    scope.insert("inputs".to_string(), JsonValue::Object(inputs.clone()));
    scope.insert("state".to_string(), JsonValue::Object(state.clone()));
    scope.insert("computed".to_string(), JsonValue::Object(computed.clone()));
    scope.insert("raw".to_string(), JsonValue::Object(state.clone()));
    scope
}

/// True when one dotted path is a prefix of the other (either direction):
/// a write to `state.user` dirties `state.user.name` and vice versa.
fn paths_overlap(left: &str, right: &str) -> bool {
    let left = left.strip_prefix("raw.").map(|rest| format!("state.{rest}")).unwrap_or_else(|| left.to_string());
    let right = right.strip_prefix("raw.").map(|rest| format!("state.{rest}")).unwrap_or_else(|| right.to_string());
    left == right
        || left.starts_with(&format!("{right}."))
        || right.starts_with(&format!("{left}."))
}

/// Kahn-free iterative DFS coloring; the first back edge surfaces the cycle.
fn topological_order(fields: &IndexMap<String, CompiledField>) -> Result<Vec<String>, WorkflowError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: IndexMap<&str, Color> = fields.keys().map(|name| (name.as_str(), Color::White)).collect();
    let mut order = Vec::with_capacity(fields.len());

    for root in fields.keys() {
        if colors[root.as_str()] != Color::White {
            continue;
        }
        // Stack entries: (field, next-dependency cursor), with the gray path
        // doubling as the cycle report.
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        colors.insert(root.as_str(), Color::Gray);

        while let Some((current, cursor)) = stack.pop() {
            let dependencies = computed_dependencies(&fields[current]);
            if cursor < dependencies.len() {
                stack.push((current, cursor + 1));
                let next = dependencies[cursor];
                if !fields.contains_key(next) {
                    // Dependency on a non-computed path; not an edge.
                    continue;
                }
                match colors[next] {
                    Color::White => {
                        colors.insert(next, Color::Gray);
                        stack.push((next, 0));
                    }
                    Color::Gray => {
                        let mut members: Vec<String> = stack.iter().map(|(name, _)| name.to_string()).collect();
                        members.push(next.to_string());
                        return Err(WorkflowError::circular_dependency(&members));
                    }
                    Color::Black => {}
                }
            } else {
                colors.insert(current, Color::Black);
                order.push(current.to_string());
            }
        }
    }

    Ok(order)
}

/// Names of computed fields a descriptor depends on (its `computed.*` deps).
fn computed_dependencies(field: &CompiledField) -> Vec<&str> {
    field
        .dependencies
        .iter()
        .filter_map(|dependency| dependency.strip_prefix("computed."))
        .map(|rest| rest.split('.').next().unwrap_or(rest))
        .collect()
}
