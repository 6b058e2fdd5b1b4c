//! Writes SQLite makes on a statement's behalf: foreign key actions and
//! triggers. None of them pass through [`crate::AuditTransaction`], so the
//! transaction refuses statements that would reach an attached relation this
//! way.

use std::collections::{HashSet, VecDeque};

use rusqlite::Connection;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::db::sql_parser::{mutation_targets, StatementTarget};
use crate::db::types::quote_identifier;
use crate::db::{Action, RelationName};
use crate::error::{AuditError, Result};

/// Every relation SQLite may write, directly or transitively, when `action`
/// is applied to `relation`. The relation itself is only included when a
/// trigger or foreign key writes back to it.
///
/// Trigger bodies that cannot be classified are over-approximated: every
/// identifier in them is treated as a relation that may be inserted into,
/// updated and deleted from.
pub fn indirect_writes(conn: &Connection, relation: &RelationName, action: Action) -> Result<Vec<StatementTarget>> {
    let mut reached = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = VecDeque::from([StatementTarget { action, relation: relation.clone() }]);

    while let Some(source) = pending.pop_front() {
        let mut next = foreign_key_actions(conn, &source)?;
        next.extend(trigger_writes(conn, &source)?);
        for target in next {
            let key = (
                target.action,
                target.relation.schema.to_lowercase(),
                target.relation.table.to_lowercase(),
            );
            if seen.insert(key) {
                pending.push_back(target.clone());
                reached.push(target);
            }
        }
    }
    Ok(reached)
}

/// Child tables changed by `ON DELETE` / `ON UPDATE` actions of foreign keys
/// referencing the source.
fn foreign_key_actions(conn: &Connection, source: &StatementTarget) -> Result<Vec<StatementTarget>> {
    let column = match source.action {
        Action::Insert => return Ok(Vec::new()),
        Action::Update => "on_update",
        Action::Delete | Action::Truncate => "on_delete",
    };
    let schema = &source.relation.schema;
    let sql = format!(
        "SELECT m.name, f.{} FROM {}.sqlite_master AS m
         JOIN pragma_foreign_key_list(m.name, ?1) AS f
         WHERE m.type = 'table' AND f.\"table\" = ?2 COLLATE NOCASE",
        column,
        quote_identifier(schema)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([schema, &source.relation.table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut targets = Vec::new();
    for (child, fk_action) in rows {
        let action = match (fk_action.to_uppercase().as_str(), source.action) {
            ("CASCADE", Action::Update) => Action::Update,
            ("CASCADE", _) => Action::Delete,
            ("SET NULL" | "SET DEFAULT", _) => Action::Update,
            _ => continue,
        };
        targets.push(StatementTarget { action, relation: RelationName::new(schema.as_str(), child) });
    }
    Ok(targets)
}

/// Relations written by the bodies of triggers that fire for the source.
fn trigger_writes(conn: &Connection, source: &StatementTarget) -> Result<Vec<StatementTarget>> {
    let event = match source.action {
        Action::Insert => Keyword::INSERT,
        Action::Update => Keyword::UPDATE,
        Action::Delete | Action::Truncate => Keyword::DELETE,
    };
    let schema = &source.relation.schema;
    let sql = format!(
        "SELECT name, sql FROM {}.sqlite_master WHERE type = 'trigger' AND tbl_name = ?1 COLLATE NOCASE
         UNION ALL
         SELECT name, sql FROM temp.sqlite_master WHERE type = 'trigger' AND tbl_name = ?1 COLLATE NOCASE",
        quote_identifier(schema)
    );
    let mut stmt = conn.prepare(&sql)?;
    let triggers = stmt
        .query_map([&source.relation.table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let dialect = SQLiteDialect {};
    let mut targets = Vec::new();
    for (name, trigger_sql) in triggers {
        let tokens = Tokenizer::new(&dialect, &trigger_sql)
            .tokenize()
            .map_err(|e| AuditError::Usage(format!("cannot read trigger {}: {}", name, e)))?;
        if first_event(&tokens) != Some(event) {
            continue;
        }

        let body = trigger_body(&tokens);
        match mutation_targets(&body) {
            Ok(written) => targets.extend(written),
            Err(e) => {
                log::warn!("Treating every name in trigger {} as written: {}", name, e);
                targets.extend(words(&tokens).flat_map(|word| {
                    [Action::Insert, Action::Update, Action::Delete]
                        .map(|action| StatementTarget { action, relation: RelationName::new(schema.as_str(), word) })
                }));
            }
        }
    }
    Ok(targets)
}

/// The event keyword in `CREATE TRIGGER ... {INSERT | UPDATE | DELETE} ON`.
fn first_event(tokens: &[Token]) -> Option<Keyword> {
    tokens.iter().find_map(|token| match token {
        Token::Word(word) if word.quote_style.is_none() => match word.keyword {
            Keyword::INSERT | Keyword::UPDATE | Keyword::DELETE => Some(word.keyword),
            _ => None,
        },
        _ => None,
    })
}

fn is_keyword(token: &Token, keyword: Keyword) -> bool {
    matches!(token, Token::Word(word) if word.quote_style.is_none() && word.keyword == keyword)
}

/// The statements between `BEGIN` and the final `END`.
fn trigger_body(tokens: &[Token]) -> String {
    let start = tokens.iter().position(|t| is_keyword(t, Keyword::BEGIN)).map_or(0, |i| i + 1);
    let end = tokens.iter().rposition(|t| is_keyword(t, Keyword::END)).unwrap_or(tokens.len());
    if start >= end {
        return String::new();
    }
    tokens[start..end].iter().map(|t| t.to_string()).collect()
}

fn words(tokens: &[Token]) -> impl Iterator<Item = &str> {
    tokens.iter().filter_map(|token| match token {
        Token::Word(word) => Some(word.value.as_str()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::test_support;

    fn target(action: Action, name: &str) -> StatementTarget {
        StatementTarget { action, relation: RelationName::parse(name) }
    }

    fn schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE Band (id INTEGER PRIMARY KEY, name TEXT);
            CREATE TABLE Member (
                id      INTEGER PRIMARY KEY,
                band_id INTEGER REFERENCES Band(id) ON DELETE CASCADE ON UPDATE SET NULL
            );
            CREATE TABLE Gig (
                id      INTEGER PRIMARY KEY,
                band_id INTEGER REFERENCES Band(id)
            );
            CREATE TABLE Setlist (
                id        INTEGER PRIMARY KEY,
                member_id INTEGER REFERENCES Member(id) ON DELETE CASCADE
            );
            CREATE TABLE Inbox (id INTEGER PRIMARY KEY, band_name TEXT);
            CREATE TRIGGER Inbox_insert AFTER INSERT ON Inbox
            BEGIN
                UPDATE Band SET name = NEW.band_name WHERE id = NEW.id;
            END;
            ",
        )?;
        Ok(())
    }

    #[test]
    fn cascades_are_followed_transitively() -> anyhow::Result<()> {
        let conn = test_support::connection()?;
        schema(&conn)?;
        let reached = indirect_writes(&conn, &RelationName::parse("Band"), Action::Delete)?;
        assert_eq!(reached, vec![target(Action::Delete, "Member"), target(Action::Delete, "Setlist")]);
        Ok(())
    }

    #[test]
    fn set_null_is_an_update() -> anyhow::Result<()> {
        let conn = test_support::connection()?;
        schema(&conn)?;
        let reached = indirect_writes(&conn, &RelationName::parse("Band"), Action::Update)?;
        assert_eq!(reached, vec![target(Action::Update, "Member")]);
        Ok(())
    }

    #[test]
    fn triggers_fire_only_for_their_event() -> anyhow::Result<()> {
        let conn = test_support::connection()?;
        schema(&conn)?;
        let inserted = indirect_writes(&conn, &RelationName::parse("Inbox"), Action::Insert)?;
        assert_eq!(inserted, vec![target(Action::Update, "Band"), target(Action::Update, "Member")]);
        assert!(indirect_writes(&conn, &RelationName::parse("Inbox"), Action::Delete)?.is_empty());
        Ok(())
    }

    #[test]
    fn plain_tables_have_no_indirect_writes() -> anyhow::Result<()> {
        let conn = test_support::connection()?;
        schema(&conn)?;
        assert!(indirect_writes(&conn, &RelationName::parse("Gig"), Action::Delete)?.is_empty());
        assert!(indirect_writes(&conn, &RelationName::parse("Band"), Action::Insert)?.is_empty());
        Ok(())
    }
}
