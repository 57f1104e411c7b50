//! WHERE/HAVING predicate evaluation against a decoded row.

use std::cmp::Ordering;

use crate::parser::ast::{CompareOp, Literal, LogicalOp, Predicate, WhereClause};
use crate::types::{Row, Value};

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Int(i) => Value::Int64(*i),
        Literal::Str(s) => Value::String(s.clone()),
    }
}

fn apply_op(ord: Ordering, op: CompareOp) -> bool {
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    }
}

pub fn eval_predicate(row: &Row, predicate: &Predicate) -> bool {
    let Some(value) = row.get(&predicate.field) else {
        return false;
    };
    let target = literal_value(&predicate.value);
    match value.compare(&target) {
        Some(ord) => apply_op(ord, predicate.op),
        None => false,
    }
}

pub fn eval_where(row: &Row, clause: &Option<WhereClause>) -> bool {
    let Some(clause) = clause else { return true };
    let first = eval_predicate(row, &clause.first);
    match &clause.rest {
        None => first,
        Some((LogicalOp::And, predicate)) => first && eval_predicate(row, predicate),
        Some((LogicalOp::Or, predicate)) => first || eval_predicate(row, predicate),
    }
}

/// Compare an aggregate result against a HAVING literal, same rule as WHERE.
pub fn eval_having_value(value: &Value, op: CompareOp, lit: &Literal) -> bool {
    let target = literal_value(lit);
    match value.compare(&target) {
        Some(ord) => apply_op(ord, op),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, name: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), Value::Int64(id));
        r.insert("name".to_string(), Value::String(name.to_string()));
        r
    }

    #[test]
    fn single_predicate_matches() {
        let p = Predicate {
            field: "id".into(),
            op: CompareOp::Gt,
            value: Literal::Int(5),
        };
        assert!(eval_predicate(&row(10, "a"), &p));
        assert!(!eval_predicate(&row(1, "a"), &p));
    }

    #[test]
    fn and_clause_requires_both() {
        let clause = WhereClause {
            first: Predicate {
                field: "id".into(),
                op: CompareOp::Gt,
                value: Literal::Int(0),
            },
            rest: Some((
                LogicalOp::And,
                Predicate {
                    field: "name".into(),
                    op: CompareOp::Eq,
                    value: Literal::Str("a".into()),
                },
            )),
        };
        assert!(eval_where(&row(1, "a"), &Some(clause.clone())));
        assert!(!eval_where(&row(1, "b"), &Some(clause)));
    }

    #[test]
    fn or_clause_requires_either() {
        let clause = WhereClause {
            first: Predicate {
                field: "id".into(),
                op: CompareOp::Eq,
                value: Literal::Int(1),
            },
            rest: Some((
                LogicalOp::Or,
                Predicate {
                    field: "id".into(),
                    op: CompareOp::Eq,
                    value: Literal::Int(2),
                },
            )),
        };
        assert!(eval_where(&row(2, "x"), &Some(clause.clone())));
        assert!(!eval_where(&row(3, "x"), &Some(clause)));
    }
}
