//! Expression dialect coverage through the public evaluation API.

use serde_json::json;
use windlass_engine::{ExprErrorKind, JsValue, Scope, compile, evaluate, evaluate_predicate};

fn scope_of(bindings: serde_json::Value) -> Scope {
    Scope::from_flattened(bindings.as_object().expect("object bindings"))
}

#[test]
fn comparison_chain_against_state() {
    let scope = scope_of(json!({"state": {"counter": 3}, "counter": 3}));
    assert!(evaluate_predicate("state.counter < 5", &scope).unwrap());
    assert!(evaluate_predicate("counter < 5 && counter > 0", &scope).unwrap());
    assert!(!evaluate_predicate("state.counter >= 5", &scope).unwrap());
}

#[test]
fn truthiness_matches_the_source_dialect() {
    let scope = scope_of(json!({
        "empty_text": "", "zero": 0, "items": [], "nothing": null
    }));
    assert!(!evaluate_predicate("empty_text", &scope).unwrap());
    assert!(!evaluate_predicate("zero", &scope).unwrap());
    assert!(!evaluate_predicate("nothing", &scope).unwrap());
    // Arrays are truthy even when empty.
    assert!(evaluate_predicate("items", &scope).unwrap());
    assert!(evaluate_predicate("items.length == 0", &scope).unwrap());
}

#[test]
fn ternary_chains_evaluate_right_associatively() {
    let scope = scope_of(json!({"score": 85}));
    let grade = evaluate("score >= 90 ? 'excellent' : score >= 70 ? 'good' : 'poor'", &scope).unwrap();
    assert_eq!(grade, JsValue::String("good".into()));
}

#[test]
fn string_concatenation_builds_summaries() {
    let scope = scope_of(json!({"passed": 8, "failed": 2}));
    let summary = evaluate("passed + '/' + (passed + failed) + ' checks passed'", &scope).unwrap();
    assert_eq!(summary, JsValue::String("8/10 checks passed".into()));
}

#[test]
fn combinators_compose_over_structured_state() {
    let scope = scope_of(json!({
        "files": [
            {"name": "a.rs", "errors": 0},
            {"name": "b.rs", "errors": 3},
            {"name": "c.rs", "errors": 1}
        ]
    }));
    let broken = evaluate("files.filter(f => f.errors > 0).map(f => f.name).join(', ')", &scope).unwrap();
    assert_eq!(broken, JsValue::String("b.rs, c.rs".into()));

    let total = evaluate("files.reduce((sum, f) => sum + f.errors, 0)", &scope).unwrap();
    assert_eq!(total, JsValue::Number(4.0));

    assert_eq!(evaluate("files.every(f => f.errors < 10)", &scope).unwrap(), JsValue::Bool(true));
    assert_eq!(evaluate("files.some(f => f.errors > 2)", &scope).unwrap(), JsValue::Bool(true));
}

#[test]
fn safe_navigation_never_throws_on_missing_chains() {
    let scope = scope_of(json!({"config": null}));
    assert_eq!(evaluate("config.servers.primary.port", &scope).unwrap(), JsValue::Undefined);
    assert_eq!(evaluate("totally.unknown[3].deep", &scope).unwrap(), JsValue::Undefined);
    assert_eq!(evaluate("typeof totally", &scope).unwrap(), JsValue::String("undefined".into()));
}

#[test]
fn division_by_zero_follows_ieee_semantics() {
    let scope = Scope::new();
    assert_eq!(evaluate("1 / 0", &scope).unwrap(), JsValue::Number(f64::INFINITY));
    assert_eq!(evaluate("-1 / 0", &scope).unwrap(), JsValue::Number(f64::NEG_INFINITY));
    let nan = evaluate("0 / 0", &scope).unwrap();
    assert!(matches!(nan, JsValue::Number(number) if number.is_nan()));
}

#[test]
fn forbidden_constructs_fail_at_compile_time() {
    for source in [
        "eval('alert(1)')",
        "Function('return 1')()",
        "require('child_process')",
        "process.env.SECRET",
        "global.leak",
        "window.location",
        "x = 5",
        "a; b",
    ] {
        let error = compile(source).unwrap_err();
        assert_eq!(error.kind, ExprErrorKind::Syntax, "expected compile rejection for {source}");
        assert_eq!(error.expression, source);
    }
}

#[test]
fn loose_and_strict_equality_differ() {
    let scope = scope_of(json!({"count": 5, "text": "5"}));
    assert!(evaluate_predicate("count == text", &scope).unwrap());
    assert!(!evaluate_predicate("count === text", &scope).unwrap());
    assert!(evaluate_predicate("count !== text", &scope).unwrap());
    assert!(evaluate_predicate("missing == null", &scope).unwrap());
}

#[test]
fn builtins_cover_the_documented_namespaces() {
    let scope = scope_of(json!({"ratio": 0.7321}));
    assert_eq!(evaluate("Math.round(ratio * 100)", &scope).unwrap(), JsValue::Number(73.0));
    assert_eq!(evaluate("Math.min(3, 1, 2)", &scope).unwrap(), JsValue::Number(1.0));
    assert_eq!(evaluate("parseInt('0042')", &scope).unwrap(), JsValue::Number(42.0));
    assert_eq!(evaluate("parseFloat('3.5 seconds')", &scope).unwrap(), JsValue::Number(3.5));
    assert_eq!(
        evaluate("JSON.stringify({count: 2})", &scope).unwrap(),
        JsValue::String("{\"count\":2}".into())
    );
    let parsed = evaluate("JSON.parse('[1, 2, 3]').length", &scope).unwrap();
    assert_eq!(parsed, JsValue::Number(3.0));
    let now = evaluate("Date.now()", &scope).unwrap();
    assert!(matches!(now, JsValue::Number(millis) if millis > 1.0e12));
}

#[test]
fn string_methods_cover_matching_and_slicing() {
    let scope = scope_of(json!({"branch": "feature/add-parser"}));
    assert!(evaluate_predicate("branch.startsWith('feature/')", &scope).unwrap());
    assert_eq!(
        evaluate("branch.split('/')[1]", &scope).unwrap(),
        JsValue::String("add-parser".into())
    );
    assert_eq!(
        evaluate("branch.slice(0, 7)", &scope).unwrap(),
        JsValue::String("feature".into())
    );
    assert_eq!(
        evaluate("branch.replace('feature', 'fix')", &scope).unwrap(),
        JsValue::String("fix/add-parser".into())
    );
    assert_eq!(evaluate("branch.toUpperCase().endsWith('PARSER')", &scope).unwrap(), JsValue::Bool(true));
}

#[test]
fn compiled_expressions_rerun_against_fresh_scopes() {
    let compiled = compile("input.length > limit").unwrap();
    let mut scope = Scope::new();
    scope.bind_json("input", &json!([1, 2, 3]));
    scope.bind_json("limit", &json!(2));
    assert_eq!(compiled.evaluate(&scope).unwrap(), JsValue::Bool(true));

    scope.bind_json("limit", &json!(5));
    assert_eq!(compiled.evaluate(&scope).unwrap(), JsValue::Bool(false));
    assert_eq!(compiled.source(), "input.length > limit");
}

#[test]
fn runtime_type_errors_are_typed() {
    let scope = Scope::new();
    let error = evaluate("missing.map(x => x)", &scope).unwrap_err();
    assert_eq!(error.kind, ExprErrorKind::Type);

    let error = evaluate("unknownFunction(1)", &scope).unwrap_err();
    assert_eq!(error.kind, ExprErrorKind::Reference);
    assert!(error.message.contains("unknownFunction"));
}

#[test]
fn object_and_array_literals_build_values() {
    let scope = scope_of(json!({"name": "windlass"}));
    let value = evaluate("{project: name, tags: ['engine', 'workflow'], stable: false}", &scope).unwrap();
    let json_value = value.into_json();
    assert_eq!(json_value["project"], json!("windlass"));
    assert_eq!(json_value["tags"], json!(["engine", "workflow"]));
    assert_eq!(json_value["stable"], json!(false));
}
