//! Schema diff: ordered safe/unsafe DDL against the live database.
//!
//! The diff compares each registered schema's generated `CREATE TABLE`
//! against `SHOW TABLES` + `SHOW CREATE TABLE`. An alter is safe iff it is
//! an additive column/index change or a drop against an empty table.

use std::collections::{BTreeMap, HashSet};

use crate::engine::Engine;
use crate::error::Result;
use crate::value::DbValue;

/// One proposed DDL statement.
#[derive(Debug, Clone)]
pub struct Alter {
    pub sql: String,
    pub safe: bool,
    pub pool: String,
}

pub(crate) fn get_alters(engine: &Engine) -> Result<Vec<Alter>> {
    let registry = engine.registry();
    let enums = registry.enums();
    let table_for_entity = registry.table_for_entity();

    let mut safe = Vec::new();
    let mut unsafe_alters = Vec::new();

    let mut pools: Vec<String> = registry
        .schemas()
        .values()
        .map(|schema| schema.pool_name().to_string())
        .collect();
    pools.sort();
    pools.dedup();

    let mut tables_in_db: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    for pool in &pools {
        let rows = registry.pool(pool)?.query("SHOW TABLES", &[])?;
        let tables: HashSet<String> = rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(DbValue::Text(name)) => Some(name),
                _ => None,
            })
            .collect();
        tables_in_db.insert(pool.clone(), tables);
    }

    let mut entity_names: Vec<&String> = registry.schemas().keys().collect();
    entity_names.sort();
    let mut tables_in_entities: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    for name in entity_names {
        let schema = &registry.schemas()[name];
        let pool = schema.pool_name().to_string();
        tables_in_entities
            .entry(pool.clone())
            .or_default()
            .insert(schema.table_name().to_string());
        let desired = schema.create_table_ddl(enums, &table_for_entity);

        let exists = tables_in_db
            .get(&pool)
            .is_some_and(|tables| tables.contains(schema.table_name()));
        if !exists {
            safe.push(Alter {
                sql: format!("{desired};"),
                safe: true,
                pool,
            });
            continue;
        }

        let shown = registry.pool(&pool)?.query(
            &format!("SHOW CREATE TABLE `{}`", schema.table_name()),
            &[],
        )?;
        let Some(DbValue::Text(existing)) =
            shown.into_iter().next().and_then(|row| row.into_iter().nth(1))
        else {
            continue;
        };
        if normalized(&existing) == normalized(&desired) {
            continue;
        }
        let empty = table_is_empty(engine, &pool, schema.table_name())?;
        if let Some(alter) = diff_table(schema.table_name(), &existing, &desired, empty) {
            if alter.0 {
                safe.push(Alter {
                    sql: alter.1,
                    safe: true,
                    pool,
                });
            } else {
                unsafe_alters.push(Alter {
                    sql: alter.1,
                    safe: false,
                    pool,
                });
            }
        }
    }

    // Tables with no registered entity get dropped; audit tables are owned
    // by the log receiver and left alone.
    for (pool, tables) in &tables_in_db {
        let known = tables_in_entities.get(pool);
        let mut orphans: Vec<&String> = tables
            .iter()
            .filter(|table| !table.starts_with("_log_"))
            .filter(|table| !known.is_some_and(|set| set.contains(*table)))
            .collect();
        orphans.sort();
        for table in orphans {
            let drop = format!("DROP TABLE `{table}`;");
            if table_is_empty(engine, pool, table)? {
                safe.push(Alter {
                    sql: drop,
                    safe: true,
                    pool: pool.clone(),
                });
            } else {
                unsafe_alters.push(Alter {
                    sql: drop,
                    safe: false,
                    pool: pool.clone(),
                });
            }
        }
    }

    safe.extend(unsafe_alters);
    Ok(safe)
}

fn table_is_empty(engine: &Engine, pool: &str, table: &str) -> Result<bool> {
    let rows = engine
        .registry()
        .pool(pool)?
        .query(&format!("SELECT `ID` FROM `{table}` LIMIT 1"), &[])?;
    Ok(rows.is_empty())
}

fn normalized(ddl: &str) -> String {
    ddl.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Body lines of a `CREATE TABLE`, keyed by kind.
struct TableBody {
    /// column name → full definition line.
    columns: BTreeMap<String, String>,
    column_order: Vec<String>,
    /// index/constraint name → full definition line.
    keys: BTreeMap<String, String>,
}

fn parse_body(ddl: &str) -> TableBody {
    let mut columns = BTreeMap::new();
    let mut column_order = Vec::new();
    let mut keys = BTreeMap::new();
    for raw in ddl.lines() {
        let line = raw.trim().trim_end_matches(',');
        if line.starts_with('`') {
            if let Some(name) = backticked(line) {
                columns.insert(name.clone(), line.to_string());
                column_order.push(name);
            }
        } else if line.starts_with("PRIMARY KEY") {
            keys.insert("PRIMARY".to_string(), line.to_string());
        } else if line.starts_with("INDEX")
            || line.starts_with("UNIQUE INDEX")
            || line.starts_with("KEY")
            || line.starts_with("UNIQUE KEY")
            || line.starts_with("CONSTRAINT")
        {
            if let Some(name) = backticked(line) {
                keys.insert(name, line.to_string());
            }
        }
    }
    TableBody {
        columns,
        column_order,
        keys,
    }
}

fn backticked(line: &str) -> Option<String> {
    let start = line.find('`')? + 1;
    let end = start + line[start..].find('`')?;
    Some(line[start..end].to_string())
}

/// One `ALTER TABLE` covering every difference; safe iff all clauses are
/// additive (or drops against an empty table).
fn diff_table(table: &str, existing: &str, desired: &str, empty: bool) -> Option<(bool, String)> {
    let existing = parse_body(existing);
    let desired = parse_body(desired);

    let mut clauses: Vec<(bool, String)> = Vec::new();

    let mut previous: Option<&String> = None;
    for name in &desired.column_order {
        let line = &desired.columns[name];
        match existing.columns.get(name) {
            None => {
                let position = previous.map_or_else(
                    || " FIRST".to_string(),
                    |prev| format!(" AFTER `{prev}`"),
                );
                clauses.push((true, format!("ADD COLUMN {line}{position}")));
            }
            Some(current) if normalized(current) != normalized(line) => {
                clauses.push((false, format!("MODIFY {line}")));
            }
            Some(_) => {}
        }
        previous = Some(name);
    }
    for name in existing.column_order.iter().rev() {
        if !desired.columns.contains_key(name) {
            clauses.push((empty, format!("DROP COLUMN `{name}`")));
        }
    }

    for (name, line) in &desired.keys {
        match existing.keys.get(name) {
            None => {
                let additive = !line.starts_with("CONSTRAINT");
                clauses.push((additive, format!("ADD {line}")));
            }
            Some(current) if normalized(current) != normalized(line) => {
                if name == "PRIMARY" {
                    clauses.push((false, format!("DROP PRIMARY KEY, ADD {line}")));
                } else {
                    clauses.push((empty, format!("DROP INDEX `{name}`")));
                    clauses.push((true, format!("ADD {line}")));
                }
            }
            Some(_) => {}
        }
    }
    for name in existing.keys.keys() {
        if name == "PRIMARY" || desired.keys.contains_key(name) {
            continue;
        }
        if existing.keys[name].starts_with("CONSTRAINT") {
            clauses.push((empty, format!("DROP FOREIGN KEY `{name}`")));
        } else {
            clauses.push((empty, format!("DROP INDEX `{name}`")));
        }
    }

    if clauses.is_empty() {
        return None;
    }
    let safe = clauses.iter().all(|(safe, _)| *safe);
    let body: Vec<String> = clauses.into_iter().map(|(_, clause)| clause).collect();
    Some((
        safe,
        format!("ALTER TABLE `{table}`\n    {};", body.join(",\n    ")),
    ))
}
