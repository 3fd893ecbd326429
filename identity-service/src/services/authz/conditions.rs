//! Policy condition evaluation against request context.

use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::{Condition, ConditionOperator, PolicyContext};

/// True when every condition holds. A key missing from the context fails.
pub fn conditions_hold(conditions: &BTreeMap<String, Condition>, context: &PolicyContext) -> bool {
    conditions.iter().all(|(key, condition)| match context.get(key) {
        Some(actual) => condition_holds(condition, actual),
        None => false,
    })
}

pub fn condition_holds(condition: &Condition, actual: &Value) -> bool {
    let expected = &condition.value;
    match condition.operator {
        ConditionOperator::Equals => values_equal(actual, expected),
        ConditionOperator::In => match expected {
            Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
            _ => false,
        },
        ConditionOperator::NotIn => match expected {
            Value::Array(options) => !options.iter().any(|o| values_equal(actual, o)),
            _ => false,
        },
        ConditionOperator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::LessThan => compare(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Unsupported => false,
    }
}

/// Numbers compare by value, so `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Numbers numerically, strings lexicographically, anything else is incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(operator: ConditionOperator, value: Value) -> Condition {
        Condition::new(operator, value)
    }

    fn context(value: Value) -> PolicyContext {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_equals_is_numeric_aware() {
        let c = cond(ConditionOperator::Equals, json!(1));
        assert!(condition_holds(&c, &json!(1.0)));
        assert!(!condition_holds(&c, &json!("1")));

        let c = cond(ConditionOperator::Equals, json!(true));
        assert!(condition_holds(&c, &json!(true)));
        assert!(!condition_holds(&c, &json!(false)));
    }

    #[test]
    fn test_in_and_not_in() {
        let regions = json!(["us", "eu"]);
        assert!(condition_holds(&cond(ConditionOperator::In, regions.clone()), &json!("eu")));
        assert!(!condition_holds(&cond(ConditionOperator::In, regions.clone()), &json!("apac")));
        assert!(condition_holds(&cond(ConditionOperator::NotIn, regions.clone()), &json!("apac")));
        assert!(!condition_holds(&cond(ConditionOperator::NotIn, regions), &json!("us")));

        // Membership operators need a list.
        assert!(!condition_holds(&cond(ConditionOperator::In, json!("eu")), &json!("eu")));
        assert!(!condition_holds(&cond(ConditionOperator::NotIn, json!("eu")), &json!("us")));
    }

    #[test]
    fn test_ordering_operators() {
        let gt = cond(ConditionOperator::GreaterThan, json!(100));
        assert!(condition_holds(&gt, &json!(100.5)));
        assert!(!condition_holds(&gt, &json!(100)));
        assert!(!condition_holds(&gt, &json!("200")));

        let lt = cond(ConditionOperator::LessThan, json!("2024-06-01"));
        assert!(condition_holds(&lt, &json!("2024-05-31")));
        assert!(!condition_holds(&lt, &json!("2024-06-01")));
    }

    #[test]
    fn test_unsupported_operator_never_holds() {
        let c = cond(ConditionOperator::Unsupported, json!("x"));
        assert!(!condition_holds(&c, &json!("x")));
    }

    #[test]
    fn test_all_keys_must_be_present() {
        let mut conditions = BTreeMap::new();
        conditions.insert("mfa_verified".to_string(), cond(ConditionOperator::Equals, json!(true)));
        conditions.insert("order_value".to_string(), cond(ConditionOperator::LessThan, json!(10000)));

        assert!(conditions_hold(
            &conditions,
            &context(json!({"mfa_verified": true, "order_value": 500}))
        ));
        assert!(!conditions_hold(&conditions, &context(json!({"mfa_verified": true}))));
        assert!(!conditions_hold(
            &conditions,
            &context(json!({"mfa_verified": true, "order_value": 50000}))
        ));
        assert!(conditions_hold(&BTreeMap::new(), &PolicyContext::new()));
    }
}
