//! CREATE TABLE / DROP TABLE / SHOW TABLES / DESCRIBE.

use crate::error::{DbError, Result};
use crate::executor::Executor;
use crate::parser::ast::FieldDef;
use crate::types::{ExecResult, Field, Value};

fn field_from_def(def: &FieldDef) -> Field {
    Field {
        name: def.name.clone(),
        ty: def.ty.clone(),
        index_uid: None,
        unique: def.unique,
        primary: def.primary,
    }
}

impl Executor {
    pub(crate) fn create_table(&self, name: &str, fields: &[FieldDef]) -> Result<ExecResult> {
        let fields: Vec<Field> = fields.iter().map(field_from_def).collect();
        self.catalog.create_table(name, fields)?;
        Ok(ExecResult::Ok {
            message: format!("table {} created", name),
            affected_rows: 0,
            elapsed_ns: 0,
        })
    }

    pub(crate) fn drop_table(&self, name: &str) -> Result<ExecResult> {
        self.catalog.drop_table(name)?;
        Ok(ExecResult::Ok {
            message: format!("table {} dropped", name),
            affected_rows: 0,
            elapsed_ns: 0,
        })
    }

    pub(crate) fn show_tables(&self) -> Result<ExecResult> {
        let mut names = self.catalog.table_names();
        names.sort();
        let result_rows = names.len() as u64;
        Ok(ExecResult::Result {
            columns: vec!["table".to_string()],
            rows: names.into_iter().map(|n| vec![Value::String(n)]).collect(),
            result_rows,
            elapsed_ns: 0,
        })
    }

    pub(crate) fn describe(&self, table: &str) -> Result<ExecResult> {
        let table = self
            .catalog
            .get(table)
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        let rows = table
            .fields
            .iter()
            .map(|f| {
                vec![
                    Value::String(f.name.clone()),
                    Value::String(format!("{:?}", f.ty)),
                    Value::String(if f.primary {
                        "PRI".to_string()
                    } else if f.unique {
                        "UNI".to_string()
                    } else {
                        String::new()
                    }),
                ]
            })
            .collect::<Vec<_>>();
        let result_rows = rows.len() as u64;
        Ok(ExecResult::Result {
            columns: vec!["field".to_string(), "type".to_string(), "key".to_string()],
            rows,
            result_rows,
            elapsed_ns: 0,
        })
    }
}
