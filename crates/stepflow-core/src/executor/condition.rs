// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Predicate evaluation for `condition` steps.

use std::cmp::Ordering;

use serde_json::{Value, json};

use crate::models::{ConditionOperator, JsonMap, StepCondition};

/// Evaluate one predicate. Missing fields and type mismatches are `false`.
pub fn evaluate(condition: &StepCondition, variables: &JsonMap) -> bool {
    let Some(actual) = variables.get(&condition.field) else {
        return false;
    };
    let expected = &condition.value;

    match &condition.operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::NotEquals => !values_equal(actual, expected),
        ConditionOperator::GreaterThan => compare_numbers(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::LessThan => compare_numbers(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        ConditionOperator::Unknown(_) => false,
    }
}

/// Evaluate all predicates with AND semantics.
///
/// Returns the combined result and a per-predicate report for the step output.
/// An empty list is `false`.
pub fn evaluate_all(conditions: &[StepCondition], variables: &JsonMap) -> (bool, Vec<Value>) {
    if conditions.is_empty() {
        return (false, Vec::new());
    }

    let mut matched = true;
    let report = conditions
        .iter()
        .map(|condition| {
            let result = evaluate(condition, variables);
            matched &= result;
            json!({
                "field": condition.field,
                "operator": condition.operator.as_str(),
                "value": condition.value,
                "actual": variables.get(&condition.field).cloned().unwrap_or(Value::Null),
                "result": result,
            })
        })
        .collect();

    (matched, report)
}

// 10 and 10.0 are the same number.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare_numbers(a: &Value, b: &Value) -> Option<Ordering> {
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    fn cond(field: &str, op: &str, value: Value) -> StepCondition {
        StepCondition {
            field: field.to_string(),
            operator: ConditionOperator::from(op.to_string()),
            value,
        }
    }

    #[test]
    fn test_numeric_comparisons() {
        let v = vars(json!({"x": 10, "y": 2.5}));
        assert!(evaluate(&cond("x", "gt", json!(5)), &v));
        assert!(!evaluate(&cond("x", "lt", json!(5)), &v));
        assert!(evaluate(&cond("y", "less_than", json!(3)), &v));
        assert!(evaluate(&cond("x", "eq", json!(10.0)), &v));
    }

    #[test]
    fn test_non_numeric_comparison_is_false() {
        let v = vars(json!({"x": "10"}));
        assert!(!evaluate(&cond("x", "gt", json!(5)), &v));
        assert!(!evaluate(&cond("x", "lt", json!(50)), &v));
        assert!(!evaluate(&cond("x", "eq", json!(10)), &v));
    }

    #[test]
    fn test_equality_on_strings_and_bools() {
        let v = vars(json!({"tier": "gold", "approved": true}));
        assert!(evaluate(&cond("tier", "equals", json!("gold")), &v));
        assert!(evaluate(&cond("tier", "ne", json!("silver")), &v));
        assert!(evaluate(&cond("approved", "eq", json!(true)), &v));
    }

    #[test]
    fn test_contains_only_for_strings() {
        let v = vars(json!({"email": "ops@example.com", "tags": ["a"]}));
        assert!(evaluate(&cond("email", "contains", json!("@example")), &v));
        assert!(!evaluate(&cond("tags", "contains", json!("a")), &v));
    }

    #[test]
    fn test_missing_field_and_unknown_operator() {
        let v = vars(json!({"x": 1}));
        assert!(!evaluate(&cond("missing", "ne", json!(1)), &v));
        assert!(!evaluate(&cond("x", "matches", json!(1)), &v));
    }

    #[test]
    fn test_evaluate_all_and_semantics() {
        let v = vars(json!({"x": 10, "tier": "gold"}));
        let (matched, report) = evaluate_all(
            &[cond("x", "gt", json!(5)), cond("tier", "eq", json!("gold"))],
            &v,
        );
        assert!(matched);
        assert_eq!(report.len(), 2);

        let (matched, report) = evaluate_all(
            &[cond("x", "gt", json!(5)), cond("tier", "eq", json!("silver"))],
            &v,
        );
        assert!(!matched);
        assert_eq!(report[1]["result"], false);
        assert_eq!(report[1]["actual"], "gold");

        let (matched, _) = evaluate_all(&[], &v);
        assert!(!matched);
    }
}
