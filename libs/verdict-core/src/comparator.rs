//! Value comparator
//!
//! Structural equality between the value a submission returned and the
//! value a test case expects.
//!
//! **Comparison Rules:**
//! - Integers: exact
//! - Floats (either side): `|a - b| <= eps * max(1, |a|, |b|)`
//! - Booleans are not numbers, null only equals null
//! - Arrays: ordered by default, multiset when `unordered_sequences` is set
//! - Objects: same key set, values compared recursively
//!
//! A difference in the top-level kind of value (string vs number, null vs
//! array, ...) is reported as a type mismatch rather than a wrong answer.

use serde_json::{Map, Number, Value};
use verdict_common::types::ComparisonPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Match,
    Mismatch,
    TypeMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

fn kind_of(value: &Value) -> ValueKind {
    match value {
        Value::Null => ValueKind::Null,
        Value::Bool(_) => ValueKind::Bool,
        Value::Number(_) => ValueKind::Number,
        Value::String(_) => ValueKind::String,
        Value::Array(_) => ValueKind::Array,
        Value::Object(_) => ValueKind::Object,
    }
}

/// Compare an actual value against the expected one
pub fn compare(actual: &Value, expected: &Value, policy: &ComparisonPolicy) -> Comparison {
    if kind_of(actual) != kind_of(expected) {
        return Comparison::TypeMismatch;
    }

    if values_equal(actual, expected, policy) {
        Comparison::Match
    } else {
        Comparison::Mismatch
    }
}

pub fn equal(actual: &Value, expected: &Value, policy: &ComparisonPolicy) -> bool {
    values_equal(actual, expected, policy)
}

fn values_equal(a: &Value, b: &Value, policy: &ComparisonPolicy) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y, policy.float_epsilon),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            if policy.unordered_sequences {
                multiset_equal(x, y, policy)
            } else {
                x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r, policy))
            }
        }
        (Value::Object(x), Value::Object(y)) => objects_equal(x, y, policy),
        _ => false,
    }
}

fn numbers_equal(a: &Number, b: &Number, epsilon: f64) -> bool {
    if a.is_f64() || b.is_f64() {
        return match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => {
                if x == y {
                    return true;
                }
                let scale = 1f64.max(x.abs()).max(y.abs());
                (x - y).abs() <= epsilon * scale
            }
            _ => false,
        };
    }

    match (as_integer(a), as_integer(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn objects_equal(a: &Map<String, Value>, b: &Map<String, Value>, policy: &ComparisonPolicy) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| values_equal(value, other, policy)))
}

fn multiset_equal(a: &[Value], b: &[Value], policy: &ComparisonPolicy) -> bool {
    if a.len() != b.len() {
        return false;
    }

    // with a tolerance one element can match several others, so pairing
    // first-fit may miss a valid assignment; look for a perfect matching
    let candidates: Vec<Vec<usize>> = a
        .iter()
        .map(|item| {
            b.iter()
                .enumerate()
                .filter(|(_, candidate)| values_equal(item, candidate, policy))
                .map(|(idx, _)| idx)
                .collect()
        })
        .collect();

    let mut owner: Vec<Option<usize>> = vec![None; b.len()];
    for item in 0..a.len() {
        let mut visited = vec![false; b.len()];
        if !augment(item, &candidates, &mut owner, &mut visited) {
            return false;
        }
    }
    true
}

/// Kuhn's augmenting path step: give `item` a partner, re-seating earlier items if needed
fn augment(item: usize, candidates: &[Vec<usize>], owner: &mut [Option<usize>], visited: &mut [bool]) -> bool {
    for &slot in &candidates[item] {
        if visited[slot] {
            continue;
        }
        visited[slot] = true;
        if owner[slot].map_or(true, |other| augment(other, candidates, owner, visited)) {
            owner[slot] = Some(item);
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exact() -> ComparisonPolicy {
        ComparisonPolicy::default()
    }

    #[test]
    fn test_integers_are_exact() {
        assert_eq!(compare(&json!(5), &json!(5), &exact()), Comparison::Match);
        assert_eq!(compare(&json!(-1), &json!(5), &exact()), Comparison::Mismatch);
        assert!(equal(&json!(u64::MAX), &json!(u64::MAX), &exact()));
        assert!(!equal(&json!(u64::MAX), &json!(i64::MAX), &exact()));
    }

    #[test]
    fn test_float_tolerance() {
        let policy = exact();
        assert!(equal(&json!(0.1 + 0.2), &json!(0.3), &policy));
        assert!(equal(&json!(5.0), &json!(5), &policy));
        assert!(!equal(&json!(0.31), &json!(0.3), &policy));

        let loose = ComparisonPolicy {
            float_epsilon: 0.05,
            ..ComparisonPolicy::default()
        };
        assert!(equal(&json!(0.31), &json!(0.3), &loose));
    }

    #[test]
    fn test_relative_tolerance_for_large_values() {
        let policy = exact();
        assert!(equal(&json!(1.0e12 + 0.0001), &json!(1.0e12), &policy));
        assert!(!equal(&json!(1.0e12 + 1.0e4), &json!(1.0e12), &policy));
    }

    #[test]
    fn test_type_mismatch() {
        let policy = exact();
        assert_eq!(compare(&json!("5"), &json!(5), &policy), Comparison::TypeMismatch);
        assert_eq!(compare(&json!(null), &json!(5), &policy), Comparison::TypeMismatch);
        assert_eq!(compare(&json!(true), &json!(1), &policy), Comparison::TypeMismatch);
        assert_eq!(compare(&json!({"a": 1}), &json!([1]), &policy), Comparison::TypeMismatch);
    }

    #[test]
    fn test_nested_type_difference_is_mismatch() {
        assert_eq!(
            compare(&json!([1, "2"]), &json!([1, 2]), &exact()),
            Comparison::Mismatch
        );
    }

    #[test]
    fn test_sequences_ordered_by_default() {
        let policy = exact();
        assert!(equal(&json!([1, 2, 3]), &json!([1, 2, 3]), &policy));
        assert!(!equal(&json!([3, 2, 1]), &json!([1, 2, 3]), &policy));
        assert!(!equal(&json!([1, 2]), &json!([1, 2, 3]), &policy));
    }

    #[test]
    fn test_unordered_sequences() {
        let policy = ComparisonPolicy {
            unordered_sequences: true,
            ..ComparisonPolicy::default()
        };
        assert!(equal(&json!([3, 1, 2]), &json!([1, 2, 3]), &policy));
        assert!(equal(&json!([[2, 1], [3]]), &json!([[3], [1, 2]]), &policy));
        // multiplicity matters
        assert!(!equal(&json!([1, 1, 2]), &json!([1, 2, 2]), &policy));
    }

    #[test]
    fn test_unordered_tolerance_finds_pairing() {
        let policy = ComparisonPolicy {
            float_epsilon: 0.015,
            unordered_sequences: true,
        };
        // 1.0 is close to both expected values; taking 1.01 for it strands 1.02
        assert!(equal(&json!([1.0, 1.02]), &json!([1.01, 0.99]), &policy));
        assert!(!equal(&json!([1.0, 1.05]), &json!([1.01, 0.99]), &policy));
    }

    #[test]
    fn test_objects() {
        let policy = exact();
        assert!(equal(&json!({"a": 1, "b": [1, 2]}), &json!({"b": [1, 2], "a": 1}), &policy));
        assert!(!equal(&json!({"a": 1}), &json!({"a": 1, "b": 2}), &policy));
        assert!(!equal(&json!({"a": 1, "c": 2}), &json!({"a": 1, "b": 2}), &policy));
    }

    #[test]
    fn test_null_and_strings() {
        let policy = exact();
        assert!(equal(&json!(null), &json!(null), &policy));
        assert!(equal(&json!("hello"), &json!("hello"), &policy));
        assert!(!equal(&json!("Hello"), &json!("hello"), &policy));
    }
}
