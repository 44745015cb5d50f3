//! In-memory SQL driver.
//!
//! Evaluates exactly the statement shapes the engine emits (multi-row
//! INSERT, UPDATE/DELETE by primary key, narrow predicate SELECTs, the
//! introspection statements behind pool tuning and schema diffing) against
//! per-table row maps. Auto-increment, unique indexes and foreign-key
//! restrict checks behave like a single-primary MySQL.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::driver::{DriverError, DriverResult, ExecResult, PoolLimits, Row, SqlDriver};
use crate::value::DbValue;

/// Foreign key declared on a table, pointing at another table's `ID`.
#[derive(Debug, Clone)]
pub struct FkSpec {
    pub constraint: String,
    pub column: String,
    pub references: String,
}

/// Table registration for [`MemoryDb`].
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: String,
    /// Column names, `ID` first.
    pub columns: Vec<String>,
    pub uniques: Vec<(String, Vec<String>)>,
    pub foreign_keys: Vec<FkSpec>,
    pub ddl: String,
}

impl TableSpec {
    #[must_use]
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(|&column| column.to_string()).collect(),
            uniques: Vec::new(),
            foreign_keys: Vec::new(),
            ddl: String::new(),
        }
    }

    /// Audit table layout used by the log receiver.
    #[must_use]
    pub fn audit(name: &str) -> Self {
        Self::new(
            name,
            &["ID", "entity_id", "added_at", "meta", "before", "changes"],
        )
    }
}

struct Table {
    columns: Vec<String>,
    rows: BTreeMap<u64, HashMap<String, DbValue>>,
    next_id: u64,
    uniques: Vec<(String, Vec<String>)>,
    foreign_keys: Vec<FkSpec>,
    ddl: String,
}

struct DbInner {
    tables: BTreeMap<String, Table>,
    statements: Vec<String>,
    max_connections: u64,
    interactive_timeout: u64,
    configured: Option<PoolLimits>,
}

/// In-memory MySQL stand-in for tests and local development.
pub struct MemoryDb {
    inner: Mutex<DbInner>,
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDb {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DbInner {
                tables: BTreeMap::new(),
                statements: Vec::new(),
                max_connections: 100,
                interactive_timeout: 28_800,
                configured: None,
            }),
        }
    }

    pub fn set_server_vars(&self, max_connections: u64, interactive_timeout: u64) {
        let mut inner = self.lock();
        inner.max_connections = max_connections;
        inner.interactive_timeout = interactive_timeout;
    }

    pub fn register_table(&self, spec: TableSpec) {
        let mut inner = self.lock();
        inner.tables.insert(
            spec.name.clone(),
            Table {
                columns: spec.columns,
                rows: BTreeMap::new(),
                next_id: 1,
                uniques: spec.uniques,
                foreign_keys: spec.foreign_keys,
                ddl: spec.ddl,
            },
        );
    }

    /// Every statement seen so far, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.lock().statements.clear();
    }

    /// Count of statements starting with `prefix`.
    #[must_use]
    pub fn statements_matching(&self, prefix: &str) -> usize {
        self.lock()
            .statements
            .iter()
            .filter(|sql| sql.starts_with(prefix))
            .count()
    }

    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.lock()
            .tables
            .get(table)
            .map_or(0, |table| table.rows.len())
    }

    #[must_use]
    pub fn row(&self, table: &str, id: u64) -> Option<HashMap<String, DbValue>> {
        self.lock()
            .tables
            .get(table)
            .and_then(|table| table.rows.get(&id).cloned())
    }

    #[must_use]
    pub fn configured_limits(&self) -> Option<PoolLimits> {
        self.lock().configured
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

static INSERT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^INSERT INTO `(\w+)`\(([^)]*)\) VALUES (.+?)(?: ON DUPLICATE KEY UPDATE (.+))?$")
        .expect("static pattern")
});
static UPDATE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^UPDATE `(\w+)` SET (.+) WHERE `ID` (?:= \?|IN \(([?,]+)\))$")
        .expect("static pattern")
});
static DELETE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^DELETE FROM `(\w+)` WHERE `ID` IN \(([?,]+)\)$").expect("static pattern")
});
static COND_PARAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^`([\w.]+)` = \?$").expect("static pattern"));
static COND_LITERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^`([\w.]+)` = (\d+)$").expect("static pattern"));
static COND_IN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^`([\w.]+)` IN \(([?,]+)\)$").expect("static pattern"));

enum Cond {
    True,
    Eq(String, DbValue),
    In(String, Vec<DbValue>),
}

struct SelectParts {
    projection: Vec<String>,
    table: String,
    conds: Vec<Cond>,
    order: Vec<(String, bool)>,
    limit: Option<(usize, usize)>,
}

impl SqlDriver for MemoryDb {
    fn execute(&self, sql: &str, params: &[DbValue]) -> DriverResult<ExecResult> {
        let mut inner = self.lock();
        inner.statements.push(sql.to_string());

        if let Some(captures) = INSERT_RE.captures(sql) {
            return insert(&mut inner, &captures, params);
        }
        if let Some(captures) = UPDATE_RE.captures(sql) {
            return update(&mut inner, &captures, params);
        }
        if let Some(captures) = DELETE_RE.captures(sql) {
            return delete(&mut inner, &captures, params);
        }
        Err(DriverError::Unsupported(sql.to_string()))
    }

    fn query(&self, sql: &str, params: &[DbValue]) -> DriverResult<Vec<Row>> {
        let mut inner = self.lock();
        inner.statements.push(sql.to_string());

        if sql == "SELECT @@max_connections, @@interactive_timeout" {
            return Ok(vec![vec![
                DbValue::Uint(inner.max_connections),
                DbValue::Uint(inner.interactive_timeout),
            ]]);
        }
        if sql == "SHOW TABLES" {
            return Ok(inner
                .tables
                .keys()
                .map(|name| vec![DbValue::Text(name.clone())])
                .collect());
        }
        if let Some(table) = sql
            .strip_prefix("SHOW CREATE TABLE `")
            .and_then(|rest| rest.strip_suffix('`'))
        {
            let found = inner
                .tables
                .get(table)
                .ok_or_else(|| DriverError::Other(format!("unknown table '{table}'")))?;
            return Ok(vec![vec![
                DbValue::Text(table.to_string()),
                DbValue::Text(found.ddl.clone()),
            ]]);
        }
        if let Some(rest) = sql.strip_prefix("SELECT count(1) FROM ") {
            let (table, conds) = parse_from(rest, params)?;
            let found = inner
                .tables
                .get(&table)
                .ok_or_else(|| DriverError::Other(format!("unknown table '{table}'")))?;
            let count = found
                .rows
                .values()
                .filter(|row| matches_conds(&conds, row))
                .count();
            return Ok(vec![vec![DbValue::Uint(count as u64)]]);
        }
        let parts = parse_select(sql, params)?;
        let found = inner
            .tables
            .get(&parts.table)
            .ok_or_else(|| DriverError::Other(format!("unknown table '{}'", parts.table)))?;

        let mut rows: Vec<&HashMap<String, DbValue>> = found
            .rows
            .values()
            .filter(|row| matches_conds(&parts.conds, row))
            .collect();
        if !parts.order.is_empty() {
            rows.sort_by(|a, b| {
                for (column, descending) in &parts.order {
                    let left = value_of(a, column);
                    let right = value_of(b, column);
                    let ordering = compare(&left, &right);
                    if ordering != std::cmp::Ordering::Equal {
                        return if *descending { ordering.reverse() } else { ordering };
                    }
                }
                std::cmp::Ordering::Equal
            });
        }
        if let Some((offset, size)) = parts.limit {
            rows = rows.into_iter().skip(offset).take(size).collect();
        }
        Ok(rows
            .into_iter()
            .map(|row| {
                parts
                    .projection
                    .iter()
                    .map(|column| value_of(row, column))
                    .collect()
            })
            .collect())
    }

    fn configure_pool(&self, limits: PoolLimits) {
        self.lock().configured = Some(limits);
    }
}

fn insert(
    inner: &mut DbInner,
    captures: &regex::Captures<'_>,
    params: &[DbValue],
) -> DriverResult<ExecResult> {
    let table_name = captures[1].to_string();
    let columns: Vec<String> = captures[2]
        .split(',')
        .map(|column| column.trim_matches('`').to_string())
        .collect();
    let odku = captures.get(4).map(|clause| clause.as_str().to_string());

    let odku_clauses: Vec<String> = odku
        .as_deref()
        .map(|clause| clause.split(',').map(|part| part.trim().to_string()).collect())
        .unwrap_or_default();
    let odku_param_count = odku_clauses
        .iter()
        .filter(|clause| clause.ends_with('?'))
        .count();

    let row_params = &params[..params.len() - odku_param_count];
    let odku_params = &params[params.len() - odku_param_count..];
    // `INSERT INTO t() VALUES (),()` is legal for tables whose only column
    // is the auto-increment ID.
    let columns: Vec<String> = columns.into_iter().filter(|c| !c.is_empty()).collect();
    let row_count = if columns.is_empty() {
        captures[3].matches("()").count()
    } else {
        if row_params.len() % columns.len() != 0 {
            return Err(DriverError::Other("bind count mismatch".to_string()));
        }
        row_params.len() / columns.len()
    };

    // FK restrict data is only consulted on delete; inserts trust the
    // engine's ordering.
    let table = inner
        .tables
        .get_mut(&table_name)
        .ok_or_else(|| DriverError::Other(format!("unknown table '{table_name}'")))?;

    let mut first_id = 0;
    let mut rows_affected = 0;
    for index in 0..row_count {
        let chunk = if columns.is_empty() {
            &[] as &[DbValue]
        } else {
            &row_params[index * columns.len()..(index + 1) * columns.len()]
        };
        let mut row: HashMap<String, DbValue> = columns
            .iter()
            .cloned()
            .zip(chunk.iter().cloned())
            .collect();
        let explicit_id = match row.get("ID") {
            Some(value) => value.canonical().parse::<u64>().unwrap_or(0),
            None => 0,
        };

        if let Some((index, existing_id)) = unique_conflict(table, &row, None) {
            if odku.is_some() {
                let mut param_iter = odku_params.iter();
                let existing = table
                    .rows
                    .get_mut(&existing_id)
                    .ok_or_else(|| DriverError::Other("row vanished".to_string()))?;
                for clause in &odku_clauses {
                    apply_assignment(existing, clause, &mut param_iter)?;
                }
                if first_id == 0 {
                    first_id = existing_id;
                }
                rows_affected += 2;
                continue;
            }
            let entry: Vec<String> = table
                .uniques
                .iter()
                .find(|(name, _)| *name == index)
                .map(|(_, cols)| cols.iter().map(|c| value_of(&row, c).canonical()).collect())
                .unwrap_or_default();
            return Err(DriverError::DuplicateKey {
                index,
                entry: entry.join("-"),
            });
        }

        let id = if explicit_id != 0 {
            table.next_id = table.next_id.max(explicit_id + 1);
            explicit_id
        } else {
            let id = table.next_id;
            table.next_id += 1;
            id
        };
        row.insert("ID".to_string(), DbValue::Uint(id));
        table.rows.insert(id, row);
        if first_id == 0 {
            first_id = id;
        }
        rows_affected += 1;
    }
    Ok(ExecResult {
        last_insert_id: first_id,
        rows_affected,
    })
}

fn update(
    inner: &mut DbInner,
    captures: &regex::Captures<'_>,
    params: &[DbValue],
) -> DriverResult<ExecResult> {
    let table_name = captures[1].to_string();
    let assignments: Vec<String> = captures[2]
        .split(',')
        .map(|part| part.trim().to_string())
        .collect();
    let id_count = captures
        .get(3)
        .map_or(1, |list| list.as_str().matches('?').count());
    let assignment_params = params.len() - id_count;

    let table = inner
        .tables
        .get_mut(&table_name)
        .ok_or_else(|| DriverError::Other(format!("unknown table '{table_name}'")))?;

    let ids: Vec<u64> = params[assignment_params..]
        .iter()
        .map(|value| value.canonical().parse::<u64>().unwrap_or(0))
        .collect();

    let mut rows_affected = 0;
    for id in ids {
        let mut param_iter = params[..assignment_params].iter();
        // Re-check uniques with the assignments applied.
        let Some(current) = table.rows.get(&id) else {
            continue;
        };
        let mut updated = current.clone();
        for clause in &assignments {
            apply_assignment(&mut updated, clause, &mut param_iter)?;
        }
        if let Some((index, _)) = unique_conflict(table, &updated, Some(id)) {
            let entry: Vec<String> = table
                .uniques
                .iter()
                .find(|(name, _)| *name == index)
                .map(|(_, cols)| {
                    cols.iter().map(|c| value_of(&updated, c).canonical()).collect()
                })
                .unwrap_or_default();
            return Err(DriverError::DuplicateKey {
                index,
                entry: entry.join("-"),
            });
        }
        table.rows.insert(id, updated);
        rows_affected += 1;
    }
    Ok(ExecResult {
        last_insert_id: 0,
        rows_affected,
    })
}

fn delete(
    inner: &mut DbInner,
    captures: &regex::Captures<'_>,
    params: &[DbValue],
) -> DriverResult<ExecResult> {
    let table_name = captures[1].to_string();
    let ids: Vec<u64> = params
        .iter()
        .map(|value| value.canonical().parse::<u64>().unwrap_or(0))
        .collect();

    // Foreign-key restrict: any surviving row referencing a deleted ID
    // rejects the statement.
    let id_strings: Vec<String> = ids.iter().map(u64::to_string).collect();
    for (other_name, other) in &inner.tables {
        for fk in &other.foreign_keys {
            if fk.references != table_name {
                continue;
            }
            for (row_id, row) in &other.rows {
                if *other_name == table_name && ids.contains(row_id) {
                    continue;
                }
                let value = value_of(row, &fk.column).canonical();
                if id_strings.contains(&value) {
                    return Err(DriverError::ForeignKey {
                        constraint: fk.constraint.clone(),
                    });
                }
            }
        }
    }

    let table = inner
        .tables
        .get_mut(&table_name)
        .ok_or_else(|| DriverError::Other(format!("unknown table '{table_name}'")))?;
    let mut rows_affected = 0;
    for id in ids {
        if table.rows.remove(&id).is_some() {
            rows_affected += 1;
        }
    }
    Ok(ExecResult {
        last_insert_id: 0,
        rows_affected,
    })
}

fn apply_assignment<'a>(
    row: &mut HashMap<String, DbValue>,
    clause: &str,
    params: &mut impl Iterator<Item = &'a DbValue>,
) -> DriverResult<()> {
    let Some(captures) = COND_PARAM_RE.captures(clause) else {
        return Err(DriverError::Unsupported(clause.to_string()));
    };
    let value = params
        .next()
        .cloned()
        .ok_or_else(|| DriverError::Other("missing bind value".to_string()))?;
    row.insert(captures[1].to_string(), value);
    Ok(())
}

/// First unique index another row already satisfies with the same tuple.
fn unique_conflict(
    table: &Table,
    candidate: &HashMap<String, DbValue>,
    ignore_id: Option<u64>,
) -> Option<(String, u64)> {
    for (index, columns) in &table.uniques {
        let tuple: Vec<String> = columns
            .iter()
            .map(|column| value_of(candidate, column).canonical())
            .collect();
        if tuple.iter().any(String::is_empty) {
            continue;
        }
        for (id, row) in &table.rows {
            if Some(*id) == ignore_id {
                continue;
            }
            let other: Vec<String> = columns
                .iter()
                .map(|column| value_of(row, column).canonical())
                .collect();
            if tuple == other {
                return Some((index.clone(), *id));
            }
        }
    }
    None
}

fn parse_from(rest: &str, params: &[DbValue]) -> DriverResult<(String, Vec<Cond>)> {
    let (table, remainder) = split_table(rest)?;
    let conds = match remainder.strip_prefix(" WHERE ") {
        Some(conds) => parse_conds(conds, &mut params.iter())?,
        None => Vec::new(),
    };
    Ok((table, conds))
}

fn split_table(rest: &str) -> DriverResult<(String, &str)> {
    let rest = rest
        .strip_prefix('`')
        .ok_or_else(|| DriverError::Unsupported(rest.to_string()))?;
    let end = rest
        .find('`')
        .ok_or_else(|| DriverError::Unsupported(rest.to_string()))?;
    Ok((rest[..end].to_string(), &rest[end + 1..]))
}

fn parse_select(sql: &str, params: &[DbValue]) -> DriverResult<SelectParts> {
    let rest = sql
        .strip_prefix("SELECT ")
        .ok_or_else(|| DriverError::Unsupported(sql.to_string()))?;
    let from = rest
        .find(" FROM ")
        .ok_or_else(|| DriverError::Unsupported(sql.to_string()))?;
    let projection: Vec<String> = rest[..from]
        .split(',')
        .map(|column| column.trim().trim_matches('`').to_string())
        .collect();
    let (table, mut remainder) = split_table(&rest[from + 6..])?;

    let mut limit = None;
    if let Some(at) = remainder.rfind(" LIMIT ") {
        let spec = &remainder[at + 7..];
        limit = Some(match spec.split_once(',') {
            Some((offset, size)) => (
                offset.trim().parse::<usize>().map_err(|_| {
                    DriverError::Unsupported(sql.to_string())
                })?,
                size.trim().parse::<usize>().map_err(|_| {
                    DriverError::Unsupported(sql.to_string())
                })?,
            ),
            None => (
                0,
                spec.trim().parse::<usize>().map_err(|_| {
                    DriverError::Unsupported(sql.to_string())
                })?,
            ),
        });
        remainder = &remainder[..at];
    }

    let mut order = Vec::new();
    if let Some(at) = remainder.find(" ORDER BY ") {
        for part in remainder[at + 10..].split(',') {
            let part = part.trim();
            let (column, descending) = match part.strip_suffix(" DESC") {
                Some(column) => (column, true),
                None => (part.strip_suffix(" ASC").unwrap_or(part), false),
            };
            order.push((column.trim_matches('`').to_string(), descending));
        }
        remainder = &remainder[..at];
    }

    let conds = match remainder.strip_prefix(" WHERE ") {
        Some(conds) => parse_conds(conds.trim_end(), &mut params.iter())?,
        None if remainder.trim().is_empty() => Vec::new(),
        None => return Err(DriverError::Unsupported(sql.to_string())),
    };

    Ok(SelectParts {
        projection,
        table,
        conds,
        order,
        limit,
    })
}

fn parse_conds<'a>(
    conds: &str,
    params: &mut impl Iterator<Item = &'a DbValue>,
) -> DriverResult<Vec<Cond>> {
    let mut parsed = Vec::new();
    for part in conds.split(" AND ") {
        let part = part.trim();
        if part == "1" {
            parsed.push(Cond::True);
        } else if let Some(captures) = COND_PARAM_RE.captures(part) {
            let value = params
                .next()
                .cloned()
                .ok_or_else(|| DriverError::Other("missing bind value".to_string()))?;
            parsed.push(Cond::Eq(captures[1].to_string(), value));
        } else if let Some(captures) = COND_LITERAL_RE.captures(part) {
            let literal = captures[2].parse::<u64>().unwrap_or(0);
            parsed.push(Cond::Eq(captures[1].to_string(), DbValue::Uint(literal)));
        } else if let Some(captures) = COND_IN_RE.captures(part) {
            let count = captures[2].matches('?').count();
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(
                    params
                        .next()
                        .cloned()
                        .ok_or_else(|| DriverError::Other("missing bind value".to_string()))?,
                );
            }
            parsed.push(Cond::In(captures[1].to_string(), values));
        } else {
            return Err(DriverError::Unsupported(part.to_string()));
        }
    }
    Ok(parsed)
}

fn matches_conds(conds: &[Cond], row: &HashMap<String, DbValue>) -> bool {
    conds.iter().all(|cond| match cond {
        Cond::True => true,
        Cond::Eq(column, value) => value_of(row, column).canonical() == value.canonical(),
        Cond::In(column, values) => {
            let current = value_of(row, column).canonical();
            values.iter().any(|value| value.canonical() == current)
        }
    })
}

fn value_of(row: &HashMap<String, DbValue>, column: &str) -> DbValue {
    row.get(column).cloned().unwrap_or(DbValue::Null)
}

fn compare(left: &DbValue, right: &DbValue) -> std::cmp::Ordering {
    let (left, right) = (left.canonical(), right.canonical());
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => left.cmp(&right),
    }
}
