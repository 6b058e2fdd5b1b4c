use sqlparser::ast::{FromTable, ObjectName, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

use crate::db::{Action, RelationName};
use crate::error::{AuditError, Result};

/// A relation written by a statement, and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatementTarget {
    pub action: Action,
    pub relation: RelationName,
}

/// Finds the relations each statement in `sql` mutates. Queries contribute
/// nothing unless their body is an `INSERT` or `UPDATE`, as in
/// `WITH ... UPDATE`. Tables only referenced from subqueries or joins are not
/// targets.
///
/// Any other kind of statement, such as DDL or `PRAGMA`, is a usage error:
/// what it writes cannot be determined.
pub fn mutation_targets(sql: &str) -> Result<Vec<StatementTarget>> {
    let dialect = SQLiteDialect {};
    let statements = Parser::parse_sql(&dialect, sql)?;

    let mut targets = Vec::new();
    for statement in &statements {
        extract_target_from_statement(statement, &mut targets)?;
    }
    Ok(targets)
}

fn extract_target_from_statement(statement: &Statement, targets: &mut Vec<StatementTarget>) -> Result<()> {
    match statement {
        Statement::Query(query) => {
            extract_target_from_set_expr(&query.body, targets)?;
        },
        Statement::Insert(insert) => {
            push_target(Action::Insert, &insert.table_name, targets);
        },
        Statement::Update { table, .. } => {
            extract_target_from_table_with_joins(Action::Update, table, targets);
        },
        Statement::Delete(delete) => {
            let from_tables = match &delete.from {
                FromTable::WithFromKeyword(from_tables) => from_tables,
                FromTable::WithoutKeyword(from_tables) => from_tables,
            };
            // SQLite deletes from exactly one table; joins only filter.
            if let Some(table_with_joins) = from_tables.first() {
                extract_target_from_table_with_joins(Action::Delete, table_with_joins, targets);
            }
        },
        other => return Err(unclassified(other)),
    }
    Ok(())
}

fn extract_target_from_set_expr(set_expr: &SetExpr, targets: &mut Vec<StatementTarget>) -> Result<()> {
    match set_expr {
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => {},
        SetExpr::Query(query) => {
            extract_target_from_set_expr(&query.body, targets)?;
        },
        SetExpr::SetOperation { left, right, .. } => {
            extract_target_from_set_expr(left, targets)?;
            extract_target_from_set_expr(right, targets)?;
        },
        SetExpr::Insert(statement) | SetExpr::Update(statement) => {
            extract_target_from_statement(statement, targets)?;
        },
        #[allow(unreachable_patterns)]
        other => {
            return Err(AuditError::Usage(format!(
                "cannot determine which relations the query body `{}` writes",
                other
            )))
        },
    }
    Ok(())
}

fn unclassified(statement: &Statement) -> AuditError {
    AuditError::Usage(format!(
        "cannot determine which relations `{}` writes; only queries, INSERT, UPDATE and DELETE are supported",
        statement
    ))
}

fn extract_target_from_table_with_joins(
    action: Action,
    table_with_joins: &TableWithJoins,
    targets: &mut Vec<StatementTarget>,
) {
    if let TableFactor::Table { name, .. } = &table_with_joins.relation {
        push_target(action, name, targets);
    }
}

fn push_target(action: Action, name: &ObjectName, targets: &mut Vec<StatementTarget>) {
    let parts: Vec<&str> = name.0.iter().map(|ident| ident.value.as_str()).collect();
    let relation = match parts.as_slice() {
        [table] => RelationName::new("main", *table),
        [schema, table] => RelationName::new(*schema, *table),
        _ => return,
    };
    targets.push(StatementTarget { action, relation });
}
