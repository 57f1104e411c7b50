//! SELECT, including GROUP BY / HAVING.
//!
//! The WHERE planner recognizes exactly one shape worth an index lookup: a
//! single `Eq` predicate on an indexed field. Anything else — a second
//! predicate, a range comparison, no WHERE at all — falls back to walking
//! the table's primary-key B+ tree end to end, since every table is
//! guaranteed one. Either way every candidate row is re-checked against the
//! full WHERE clause before it's returned, so the fast path is purely an
//! optimization, never a correctness shortcut.

use std::collections::HashMap;

use crate::catalog::Table;
use crate::error::{DbError, Result};
use crate::executor::aggregation;
use crate::executor::evaluator::{eval_having_value, eval_where};
use crate::executor::Executor;
use crate::parser::ast::{AggFunc, CompareOp, SelectItem, SelectStatement, WhereClause};
use crate::types::{decode_row, ExecResult, Row, Value};

pub(crate) fn collect_candidate_uids(table: &Table, where_clause: &Option<WhereClause>) -> Result<Vec<u64>> {
    if let Some(clause) = where_clause {
        if clause.rest.is_none() && clause.first.op == CompareOp::Eq {
            if let crate::parser::ast::Literal::Int(key) = &clause.first.value {
                if let Some(tree) = table.indexes.get(&clause.first.field) {
                    return tree.find(*key);
                }
            }
        }
    }
    let primary = table
        .primary_field()
        .ok_or_else(|| DbError::Internal("table has no primary key".into()))?;
    let tree = table
        .indexes
        .get(&primary.name)
        .ok_or_else(|| DbError::Internal("primary key is not indexed".into()))?;
    tree.range_search(i64::MIN, i64::MAX)
}

fn is_aggregate_item(item: &SelectItem) -> bool {
    matches!(item, SelectItem::Aggregate(_, _))
}

fn agg_label(func: AggFunc) -> &'static str {
    match func {
        AggFunc::Count => "COUNT",
        AggFunc::Sum => "SUM",
        AggFunc::Avg => "AVG",
        AggFunc::Min => "MIN",
        AggFunc::Max => "MAX",
    }
}

fn select_item_names(items: &[SelectItem], table: &Table) -> Vec<String> {
    items
        .iter()
        .flat_map(|item| match item {
            SelectItem::Star => table.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
            SelectItem::Column(name) => vec![name.clone()],
            SelectItem::Aggregate(func, col) => {
                vec![format!("{}({})", agg_label(*func), col.clone().unwrap_or_else(|| "*".into()))]
            }
        })
        .collect()
}

fn project_row(items: &[SelectItem], table: &Table, row: &Row) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    for item in items {
        match item {
            SelectItem::Star => {
                for field in &table.fields {
                    out.push(
                        row.get(&field.name)
                            .cloned()
                            .ok_or_else(|| DbError::Internal("row missing field".into()))?,
                    );
                }
            }
            SelectItem::Column(name) => {
                out.push(row.get(name).cloned().ok_or_else(|| DbError::FieldNotFound(name.clone()))?);
            }
            SelectItem::Aggregate(..) => {
                return Err(DbError::InvalidCommand(
                    "aggregate function used without GROUP BY".into(),
                ));
            }
        }
    }
    Ok(out)
}

fn eval_agg_func(func: AggFunc, column: Option<&str>, rows: &[Row]) -> Result<Value> {
    let mut acc = aggregation::create_accumulator(func);
    for row in rows {
        let value = match column {
            Some(col) => row
                .get(col)
                .cloned()
                .ok_or_else(|| DbError::FieldNotFound(col.to_string()))?,
            None => Value::Int64(1),
        };
        acc.accumulate(&value)?;
    }
    Ok(acc.finalize())
}

fn eval_select_item(item: &SelectItem, rows: &[Row]) -> Result<Value> {
    match item {
        SelectItem::Aggregate(func, col) => eval_agg_func(*func, col.as_deref(), rows),
        SelectItem::Column(name) => rows
            .first()
            .and_then(|r| r.get(name).cloned())
            .ok_or_else(|| DbError::FieldNotFound(name.clone())),
        SelectItem::Star => Err(DbError::InvalidCommand(
            "* is not allowed alongside GROUP BY".into(),
        )),
    }
}

impl Executor {
    fn visible_rows(&self, xid: u64, table: &Table, where_clause: &Option<WhereClause>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for uid in collect_candidate_uids(table, where_clause)? {
            let Some(body) = self.mvcc.read(xid, uid)? else {
                continue;
            };
            let row = decode_row(&table.fields, &body)?;
            if eval_where(&row, where_clause) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub(crate) fn select(&self, xid: u64, select: SelectStatement) -> Result<ExecResult> {
        let table = self
            .catalog
            .get(&select.table)
            .ok_or_else(|| DbError::TableNotFound(select.table.clone()))?;
        let rows = self.visible_rows(xid, &table, &select.where_clause)?;

        if select.group_by.is_some() || select.items.iter().any(is_aggregate_item) {
            return self.select_aggregate(&table, rows, &select);
        }

        let columns = select_item_names(&select.items, &table);
        let mut out_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            out_rows.push(project_row(&select.items, &table, row)?);
        }
        let result_rows = out_rows.len() as u64;
        Ok(ExecResult::Result {
            columns,
            rows: out_rows,
            result_rows,
            elapsed_ns: 0,
        })
    }

    fn select_aggregate(&self, table: &Table, rows: Vec<Row>, select: &SelectStatement) -> Result<ExecResult> {
        if let Some(col) = &select.group_by {
            table.field(col).ok_or_else(|| DbError::FieldNotFound(col.clone()))?;
        }
        for item in &select.items {
            if let SelectItem::Column(name) = item {
                if select.group_by.as_deref() != Some(name.as_str()) {
                    return Err(DbError::InvalidCommand(format!(
                        "column {} must appear in GROUP BY",
                        name
                    )));
                }
            }
        }

        let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
        for row in rows {
            let key = match &select.group_by {
                Some(col) => {
                    let value = row
                        .get(col)
                        .ok_or_else(|| DbError::Internal(format!("row missing grouped column {col}")))?;
                    format!("{:?}", value)
                }
                None => String::new(),
            };
            groups.entry(key).or_default().push(row);
        }

        let columns = select_item_names(&select.items, table);
        let mut out_rows = Vec::new();
        for group_rows in groups.into_values() {
            if let Some(having) = &select.having {
                let agg_value = eval_agg_func(having.agg, having.column.as_deref(), &group_rows)?;
                if !eval_having_value(&agg_value, having.op, &having.value) {
                    continue;
                }
            }
            let mut values = Vec::with_capacity(select.items.len());
            for item in &select.items {
                values.push(eval_select_item(item, &group_rows)?);
            }
            out_rows.push(values);
        }
        let result_rows = out_rows.len() as u64;
        Ok(ExecResult::Result {
            columns,
            rows: out_rows,
            result_rows,
            elapsed_ns: 0,
        })
    }
}
