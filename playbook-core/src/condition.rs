//! Boolean condition expressions over the run context.
//!
//! Deliberately not Turing-complete: a recursive tagged variant of
//! comparisons and and/or groups, evaluated by recursive descent.
//! Evaluation is pure; an unknown field evaluates to "condition not met"
//! rather than erroring, so run progression stays resilient to partial
//! context.

use crate::types::{RunContext, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    /// Regex match against a string field.
    Matches,
    In,
    NotIn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn as_ms(&self, n: u64) -> i64 {
        let unit = match self {
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        };
        (n as i64).saturating_mul(unit)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub duration: u64,
    pub unit: TimeUnit,
}

/// Either a leaf comparison, a nested and/or group, or a recency check.
/// Untagged: the wire shape is exactly `{field, operator, value}`,
/// `{logic, conditions}` or `{field, within}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionExpr {
    Composite {
        logic: Logic,
        conditions: Vec<ConditionExpr>,
    },
    Window {
        field: String,
        within: TimeWindow,
    },
    Leaf {
        field: String,
        operator: ConditionOp,
        value: Value,
    },
}

impl ConditionExpr {
    /// Evaluate against a context snapshot. `now_ms` anchors time-window
    /// leaves so evaluation stays deterministic under test.
    pub fn evaluate(&self, ctx: &RunContext, now_ms: Timestamp) -> bool {
        match self {
            ConditionExpr::Composite { logic, conditions } => match logic {
                Logic::And => conditions.iter().all(|c| c.evaluate(ctx, now_ms)),
                Logic::Or => conditions.iter().any(|c| c.evaluate(ctx, now_ms)),
            },
            ConditionExpr::Window { field, within } => {
                let Some(ts) = lookup(ctx, field).and_then(as_epoch_ms) else {
                    return false;
                };
                let window = within.unit.as_ms(within.duration);
                ts >= now_ms.saturating_sub(window) && ts <= now_ms
            }
            ConditionExpr::Leaf {
                field,
                operator,
                value,
            } => {
                let Some(actual) = lookup(ctx, field) else {
                    return false;
                };
                compare(actual, *operator, value)
            }
        }
    }
}

/// Resolve a possibly-dotted path (`"stepA.sentiment"`) into the context.
fn lookup<'a>(ctx: &'a RunContext, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let head = parts.next()?;
    let mut current = ctx.get(head)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn compare(actual: &Value, op: ConditionOp, expected: &Value) -> bool {
    match op {
        ConditionOp::Eq => json_eq(actual, expected),
        ConditionOp::Ne => !json_eq(actual, expected),
        ConditionOp::Gt => ordering(actual, expected).is_some_and(|o| o.is_gt()),
        ConditionOp::Gte => ordering(actual, expected).is_some_and(|o| o.is_ge()),
        ConditionOp::Lt => ordering(actual, expected).is_some_and(|o| o.is_lt()),
        ConditionOp::Lte => ordering(actual, expected).is_some_and(|o| o.is_le()),
        ConditionOp::Contains => match (actual, expected) {
            (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| json_eq(i, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            _ => false,
        },
        ConditionOp::Matches => match (actual, expected) {
            (Value::String(s), Value::String(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
        ConditionOp::In => expected
            .as_array()
            .is_some_and(|set| set.iter().any(|v| json_eq(actual, v))),
        ConditionOp::NotIn => expected
            .as_array()
            .is_some_and(|set| !set.iter().any(|v| json_eq(actual, v))),
    }
}

/// Equality with numeric normalization (`1` == `1.0`).
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Some(x.cmp(y));
    }
    None
}

fn as_epoch_ms(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> RunContext {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn leaf(field: &str, operator: ConditionOp, value: Value) -> ConditionExpr {
        ConditionExpr::Leaf {
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn leaf_eq_and_ne() {
        let c = ctx(&[("riskLevel", json!("low"))]);
        assert!(leaf("riskLevel", ConditionOp::Eq, json!("low")).evaluate(&c, 0));
        assert!(!leaf("riskLevel", ConditionOp::Eq, json!("high")).evaluate(&c, 0));
        assert!(leaf("riskLevel", ConditionOp::Ne, json!("high")).evaluate(&c, 0));
    }

    #[test]
    fn numeric_ordering_normalizes_int_and_float() {
        let c = ctx(&[("sentiment", json!(-0.4))]);
        assert!(leaf("sentiment", ConditionOp::Lt, json!(0)).evaluate(&c, 0));
        assert!(leaf("sentiment", ConditionOp::Gte, json!(-0.4)).evaluate(&c, 0));
        assert!(!leaf("sentiment", ConditionOp::Gt, json!(1)).evaluate(&c, 0));
        let c2 = ctx(&[("mentions", json!(42))]);
        assert!(leaf("mentions", ConditionOp::Eq, json!(42.0)).evaluate(&c2, 0));
    }

    #[test]
    fn unknown_field_is_not_met_never_an_error() {
        let c = ctx(&[]);
        assert!(!leaf("missing", ConditionOp::Eq, json!(1)).evaluate(&c, 0));
        assert!(!leaf("missing", ConditionOp::Ne, json!(1)).evaluate(&c, 0));
        assert!(!leaf("missing", ConditionOp::NotIn, json!([1])).evaluate(&c, 0));
    }

    #[test]
    fn contains_over_strings_arrays_objects() {
        let c = ctx(&[
            ("headline", json!("market selloff deepens")),
            ("tags", json!(["crisis", "finance"])),
            ("by_outlet", json!({"reuters": 3})),
        ]);
        assert!(leaf("headline", ConditionOp::Contains, json!("selloff")).evaluate(&c, 0));
        assert!(leaf("tags", ConditionOp::Contains, json!("crisis")).evaluate(&c, 0));
        assert!(leaf("by_outlet", ConditionOp::Contains, json!("reuters")).evaluate(&c, 0));
        assert!(!leaf("tags", ConditionOp::Contains, json!("sports")).evaluate(&c, 0));
    }

    #[test]
    fn matches_is_regex_and_fails_closed_on_bad_pattern() {
        let c = ctx(&[("source", json!("twitter.com/acme"))]);
        assert!(leaf("source", ConditionOp::Matches, json!("^twitter")).evaluate(&c, 0));
        assert!(!leaf("source", ConditionOp::Matches, json!("[unclosed")).evaluate(&c, 0));
    }

    #[test]
    fn in_and_not_in() {
        let c = ctx(&[("region", json!("emea"))]);
        assert!(leaf("region", ConditionOp::In, json!(["emea", "apac"])).evaluate(&c, 0));
        assert!(!leaf("region", ConditionOp::In, json!(["amer"])).evaluate(&c, 0));
        assert!(leaf("region", ConditionOp::NotIn, json!(["amer"])).evaluate(&c, 0));
    }

    #[test]
    fn nested_and_or_groups() {
        let expr = ConditionExpr::Composite {
            logic: Logic::And,
            conditions: vec![
                leaf("severity", ConditionOp::Gte, json!(3)),
                ConditionExpr::Composite {
                    logic: Logic::Or,
                    conditions: vec![
                        leaf("channel", ConditionOp::Eq, json!("press")),
                        leaf("channel", ConditionOp::Eq, json!("social")),
                    ],
                },
            ],
        };
        let hit = ctx(&[("severity", json!(4)), ("channel", json!("social"))]);
        let miss = ctx(&[("severity", json!(4)), ("channel", json!("email"))]);
        assert!(expr.evaluate(&hit, 0));
        assert!(!expr.evaluate(&miss, 0));
    }

    #[test]
    fn dotted_paths_descend_into_step_results() {
        let c = ctx(&[("analyze", json!({"scores": {"overall": 0.9}}))]);
        assert!(leaf("analyze.scores.overall", ConditionOp::Gt, json!(0.5)).evaluate(&c, 0));
        assert!(!leaf("analyze.scores.missing", ConditionOp::Gt, json!(0.5)).evaluate(&c, 0));
    }

    #[test]
    fn time_window_recency() {
        let now = 1_000_000;
        let expr = ConditionExpr::Window {
            field: "last_mention_at".into(),
            within: TimeWindow {
                duration: 5,
                unit: TimeUnit::Minutes,
            },
        };
        let recent = ctx(&[("last_mention_at", json!(now - 60_000))]);
        let stale = ctx(&[("last_mention_at", json!(now - 600_000))]);
        let future = ctx(&[("last_mention_at", json!(now + 1))]);
        assert!(expr.evaluate(&recent, now));
        assert!(!expr.evaluate(&stale, now));
        assert!(!expr.evaluate(&future, now));
    }

    #[test]
    fn wire_shapes_deserialize_untagged() {
        let leaf: ConditionExpr = serde_json::from_value(json!({
            "field": "riskLevel", "operator": "eq", "value": "low"
        }))
        .unwrap();
        assert!(matches!(leaf, ConditionExpr::Leaf { .. }));

        let group: ConditionExpr = serde_json::from_value(json!({
            "logic": "and",
            "conditions": [
                {"field": "severity", "operator": "gte", "value": 2},
                {"field": "seen_at", "within": {"duration": 1, "unit": "hours"}}
            ]
        }))
        .unwrap();
        match group {
            ConditionExpr::Composite { conditions, .. } => {
                assert!(matches!(conditions[1], ConditionExpr::Window { .. }));
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }
}
