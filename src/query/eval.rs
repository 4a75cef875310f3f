//! Evaluation of query expressions against a record

use crate::core::content::PathSegment;
use crate::core::value::{Record, Value};
use crate::query::parser::{BinaryOp, Expr, Path};
use regex::Regex;
use std::cmp::Ordering;

/// Evaluation failure, turned into a `QueryError` by the caller
pub type EvalResult<T> = Result<T, String>;

pub fn evaluate(expr: &Expr, root: &Record) -> EvalResult<Value> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(lookup(path, root)?.unwrap_or(Value::Null)),
        Expr::List(items) => items
            .iter()
            .map(|item| evaluate(item, root))
            .collect::<EvalResult<Vec<_>>>()
            .map(Value::List),
        Expr::Not(inner) => {
            let value = evaluate(inner, root)?;
            value
                .to_boolean()
                .map(|b| Value::Bool(!b))
                .ok_or_else(|| format!("can not negate a {}", value.kind_name()))
        }
        Expr::Negate(inner) => match evaluate(inner, root)? {
            Value::Integer(i) => i
                .checked_neg()
                .map(Value::Integer)
                .ok_or_else(|| "integer overflow".to_string()),
            Value::Decimal(d) => Ok(Value::Decimal(-d)),
            other => Err(format!("can not negate a {}", other.kind_name())),
        },
        Expr::Binary(BinaryOp::And, lhs, rhs) => {
            if !truthy(&evaluate(lhs, root)?) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&evaluate(rhs, root)?)))
        }
        Expr::Binary(BinaryOp::Or, lhs, rhs) => {
            if truthy(&evaluate(lhs, root)?) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&evaluate(rhs, root)?)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = evaluate(lhs, root)?;
            let right = evaluate(rhs, root)?;
            binary(*op, left, right)
        }
    }
}

/// Values without a boolean form count as true when they are not null
fn truthy(value: &Value) -> bool {
    value.to_boolean().unwrap_or(true)
}

fn equals(left: &Value, right: &Value) -> bool {
    if left.loosely_equals(right) {
        return true;
    }
    if left.is_null() || right.is_null() {
        return false;
    }
    right
        .convert_like(left)
        .map(|converted| converted.loosely_equals(left))
        .unwrap_or(false)
}

fn compare(left: &Value, right: &Value) -> EvalResult<Option<Ordering>> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => Ok(None),
        (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
        (Value::Integer(a), Value::Integer(b)) => Ok(Some(a.cmp(b))),
        _ => match (numeric(left), numeric(right)) {
            (Some(a), Some(b)) => Ok(a.partial_cmp(&b)),
            _ => Err(format!(
                "can not compare {} with {}",
                left.kind_name(),
                right.kind_name()
            )),
        },
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(_) | Value::Decimal(_) => value.as_f64(),
        _ => None,
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> EvalResult<Value> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(equals(&left, &right))),
        BinaryOp::NotEq => Ok(Value::Bool(!equals(&left, &right))),
        BinaryOp::Lt => Ok(Value::Bool(compare(&left, &right)? == Some(Ordering::Less))),
        BinaryOp::LtEq => Ok(Value::Bool(matches!(
            compare(&left, &right)?,
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOp::Gt => Ok(Value::Bool(compare(&left, &right)? == Some(Ordering::Greater))),
        BinaryOp::GtEq => Ok(Value::Bool(matches!(
            compare(&left, &right)?,
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOp::Matches => {
            let (Some(text), Some(pattern)) = (left.to_text(), right.to_text()) else {
                return Ok(Value::Bool(false));
            };
            let regex = Regex::new(&format!("^(?:{})$", pattern))
                .map_err(|e| format!("invalid regex '{}': {}", pattern, e))?;
            Ok(Value::Bool(regex.is_match(&text)))
        }
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub => arithmetic(left, right, "subtract", i64::checked_sub, |a, b| a - b),
        BinaryOp::Mul => arithmetic(left, right, "multiply", i64::checked_mul, |a, b| a * b),
        BinaryOp::Rem => {
            if matches!(right, Value::Integer(0)) {
                return Err("division by zero".to_string());
            }
            arithmetic(left, right, "take the remainder of", i64::checked_rem, |a, b| a % b)
        }
        BinaryOp::And => Ok(Value::Bool(truthy(&left) && truthy(&right))),
        BinaryOp::Or => Ok(Value::Bool(truthy(&left) || truthy(&right))),
    }
}

fn add(left: Value, right: Value) -> EvalResult<Value> {
    match (left, right) {
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (Value::List(mut a), other) => {
            a.push(other);
            Ok(Value::List(a))
        }
        // An unset list behaves like an empty one
        (Value::Null, list @ Value::List(_)) => Ok(list),
        (left @ Value::String(_), right) | (left, right @ Value::String(_)) => Ok(Value::String(
            format!("{}{}", text_or_null(&left), text_or_null(&right)),
        )),
        (left, right) => arithmetic(left, right, "add", i64::checked_add, |a, b| a + b),
    }
}

fn text_or_null(value: &Value) -> String {
    value.to_text().unwrap_or_else(|| value.to_string())
}

fn arithmetic(
    left: Value,
    right: Value,
    verb: &str,
    integer: fn(i64, i64) -> Option<i64>,
    decimal: fn(f64, f64) -> f64,
) -> EvalResult<Value> {
    match (&left, &right) {
        (Value::Integer(a), Value::Integer(b)) => integer(*a, *b)
            .map(Value::Integer)
            .ok_or_else(|| "integer overflow".to_string()),
        _ => match (numeric(&left), numeric(&right)) {
            (Some(a), Some(b)) => Ok(Value::Decimal(decimal(a, b))),
            _ => Err(format!(
                "can not {} {} and {}",
                verb,
                left.kind_name(),
                right.kind_name()
            )),
        },
    }
}

/// Resolve a path, `None` when some part of it is undefined
pub fn lookup(path: &Path, root: &Record) -> EvalResult<Option<Value>> {
    let mut current: Option<Value> = None;
    for (position, part) in path.parts.iter().enumerate() {
        let next = if position == 0 {
            root.get(&part.name).cloned()
        } else {
            match current {
                Some(value) => field_of(value, &part.name),
                None => None,
            }
        };
        current = next;
        for index in &part.indexes {
            let key = evaluate(index, root)?;
            current = match current {
                Some(value) => index_of(value, &key)?,
                None => None,
            };
        }
        if current.is_none() {
            return Ok(None);
        }
    }
    Ok(current)
}

fn field_of(value: Value, name: &str) -> Option<Value> {
    match value {
        Value::Record(mut record) => record.shift_remove(name),
        Value::List(items) => Some(Value::List(
            items
                .into_iter()
                .filter_map(|item| field_of(item, name))
                .collect(),
        )),
        Value::Error(error) => match name {
            "message" => Some(Value::String(error.message.clone())),
            "code" => error.code.clone().map(Value::String),
            "description" => error.description.clone().map(Value::String),
            "data" => error.data.clone(),
            "source" => error.source_id.clone().map(Value::String),
            "class" => Some(Value::String(error.class.to_string())),
            "cause" => error.cause.clone().map(Value::Error),
            _ => None,
        },
        _ => None,
    }
}

fn index_of(value: Value, key: &Value) -> EvalResult<Option<Value>> {
    match (value, key) {
        (Value::List(mut items), Value::Integer(i)) => {
            let index = if *i < 0 { items.len() as i64 + i } else { *i };
            if index < 0 || index as usize >= items.len() {
                Ok(None)
            } else {
                Ok(Some(items.swap_remove(index as usize)))
            }
        }
        (Value::Record(mut record), Value::String(name)) => Ok(record.shift_remove(name)),
        (Value::Null, _) => Ok(None),
        (value, key) => Err(format!(
            "can not index a {} with a {}",
            value.kind_name(),
            key.kind_name()
        )),
    }
}

/// Turn a path into assignable segments, evaluating index expressions
pub fn resolve(path: &Path, root: &Record) -> EvalResult<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for part in &path.parts {
        segments.push(PathSegment::Field(part.name.clone()));
        for index in &part.indexes {
            match evaluate(index, root)? {
                Value::Integer(i) if i >= 0 => segments.push(PathSegment::Index(i as usize)),
                Value::String(name) => segments.push(PathSegment::Field(name)),
                other => return Err(format!("can not use a {} as an index", other.kind_name())),
            }
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::parse;

    fn eval(source: &str, root: &Value) -> Value {
        evaluate(&parse(source).unwrap(), root.as_record().unwrap()).unwrap()
    }

    fn sample() -> Value {
        Value::from(serde_json::json!({
            "i": 1,
            "name": "ada",
            "items": [
                {"name": "a", "price": 2},
                {"name": "b", "price": 3}
            ],
            "empty": null
        }))
    }

    #[test]
    fn test_paths() {
        let root = sample();
        assert_eq!(eval("name", &root), Value::from("ada"));
        assert_eq!(eval("/items[i]/name", &root), Value::from("b"));
        assert_eq!(eval("items[-1]/price", &root), Value::from(3));
        assert_eq!(eval("items/name", &root), Value::List(vec!["a".into(), "b".into()]));
        assert_eq!(eval("missing/deeper", &root), Value::Null);
        assert_eq!(eval("items[5]", &root), Value::Null);
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let root = sample();
        assert_eq!(eval("items[0]/price * 2 + 1", &root), Value::from(5));
        assert_eq!(eval("i + 0.5", &root), Value::from(1.5));
        assert_eq!(eval("7 % 4", &root), Value::from(3));
        assert_eq!(eval("-i", &root), Value::from(-1));
        assert_eq!(eval("i < 2 && name == 'ada'", &root), Value::from(true));
        assert_eq!(eval("'1' == i", &root), Value::from(true));
        assert_eq!(eval("empty == null", &root), Value::from(true));
        assert_eq!(eval("empty > 1", &root), Value::from(false));
    }

    #[test]
    fn test_string_concatenation_and_regex() {
        let root = sample();
        assert_eq!(eval("'hi ' + name", &root), Value::from("hi ada"));
        assert_eq!(eval("name ~ 'a.a'", &root), Value::from(true));
        assert_eq!(eval("name ~ 'a'", &root), Value::from(false));
    }

    #[test]
    fn test_list_literal_and_append() {
        let root = sample();
        assert_eq!(eval("[i * 2]", &root), Value::List(vec![Value::from(2)]));
        assert_eq!(eval("[1] + [2] + 3", &root), Value::List(vec![1.into(), 2.into(), 3.into()]));
        assert_eq!(eval("empty + [i]", &root), Value::List(vec![1.into()]));
    }

    #[test]
    fn test_errors() {
        let root = sample();
        let record = root.as_record().unwrap();
        assert!(evaluate(&parse("name * 2").unwrap(), record).is_err());
        assert!(evaluate(&parse("i % 0").unwrap(), record).is_err());
        assert!(evaluate(&parse("name[1]").unwrap(), record).is_err());
    }

    #[test]
    fn test_resolve() {
        let root = sample();
        let Expr::Path(path) = parse("items[i + 1]/name").unwrap() else {
            panic!("expected a path");
        };
        assert_eq!(
            resolve(&path, root.as_record().unwrap()).unwrap(),
            vec![
                PathSegment::Field("items".into()),
                PathSegment::Index(2),
                PathSegment::Field("name".into())
            ]
        );
    }

    #[test]
    fn test_error_fields() {
        use crate::core::error::{ErrorClass, ExecutionError};
        let error = ExecutionError::new(ErrorClass::Business, "boom")
            .with_code("E1")
            .with_cause(ExecutionError::new(ErrorClass::Query, "inner"));
        let root = Value::record([("failure", Value::from(error))]);
        assert_eq!(eval("failure/message", &root), Value::from("boom"));
        assert_eq!(eval("failure/code", &root), Value::from("E1"));
        assert_eq!(eval("failure/cause/message", &root), Value::from("inner"));
        assert_eq!(eval("failure/description", &root), Value::Null);
    }
}
