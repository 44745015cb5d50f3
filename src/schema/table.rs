//! Compiled, immutable table schemas.
//!
//! A [`TableSchema`] is derived once from an [`EntityDescriptor`] at
//! registry validation and shared behind `Arc` afterwards.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::entity::{EntityDescriptor, FieldDef, FieldKind};
use crate::error::{OrmError, Result};
use crate::value::{DbValue, fnv1a_32};

/// Flattened column kind (embedded structs are gone at this level).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uint,
    Int,
    Float32,
    Float64,
    Bool,
    String,
    Bytes,
    Json,
    Date,
    Enum,
    Set,
    Ref,
}

/// Compiled metadata for one non-ID column.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub kind: ColumnKind,
    pub bits: u8,
    pub required: bool,
    pub length: Option<String>,
    pub decimal: Option<(u8, u8)>,
    pub precision: Option<u8>,
    pub unsigned: bool,
    pub mediumint: bool,
    pub year: bool,
    pub with_time: bool,
    pub values_name: Option<String>,
}

/// A to-one reference column and its delete policy.
#[derive(Debug, Clone)]
pub struct RefMeta {
    pub column: String,
    pub entity: String,
    pub cascade: bool,
}

/// A compiled cached-query definition.
#[derive(Debug, Clone)]
pub struct CachedQueryDef {
    pub name: String,
    pub one: bool,
    pub max: usize,
    /// Template with `:Field` markers rewritten to backticked columns.
    pub sql: String,
    /// Bound parameter fields in template order (`:ID` excluded).
    pub fields: Vec<String>,
    /// Whether the key hash appends an implicit `FakeDelete = 0` parameter.
    pub fake_param: bool,
}

/// Default row cap for multi-row cached queries.
pub const DEFAULT_CACHED_QUERY_MAX: usize = 50_000;

/// Immutable derivative of an entity type: columns, indexes, references,
/// cache policy, cached queries and queue subscriptions.
#[derive(Debug)]
pub struct TableSchema {
    pub(crate) entity_name: String,
    pub(crate) table_name: String,
    pub(crate) pool_name: String,
    pub(crate) cache_prefix: String,
    pub(crate) columns_stamp: u32,
    /// Ordered column names, `ID` first.
    pub(crate) column_names: Vec<String>,
    /// `dotted.path` → flat column name.
    pub(crate) column_paths: BTreeMap<String, String>,
    /// Non-ID columns in order.
    pub(crate) columns: Vec<ColumnMeta>,
    pub(crate) one_refs: Vec<RefMeta>,
    pub(crate) indexes: BTreeMap<String, Vec<String>>,
    pub(crate) uniques: BTreeMap<String, Vec<String>>,
    pub(crate) cached_queries: BTreeMap<String, CachedQueryDef>,
    pub(crate) dirty_entity_queues: Vec<String>,
    pub(crate) dirty_field_queues: BTreeMap<String, Vec<String>>,
    pub(crate) log_queue: Option<String>,
    pub(crate) log_table: String,
    pub(crate) has_fake_delete: bool,
    pub(crate) local_cache: Option<String>,
    pub(crate) redis_cache: Option<String>,
}

impl TableSchema {
    #[must_use]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    #[must_use]
    pub fn column_paths(&self) -> &BTreeMap<String, String> {
        &self.column_paths
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn references(&self) -> &[RefMeta] {
        &self.one_refs
    }

    #[must_use]
    pub fn uniques(&self) -> &BTreeMap<String, Vec<String>> {
        &self.uniques
    }

    #[must_use]
    pub fn indexes(&self) -> &BTreeMap<String, Vec<String>> {
        &self.indexes
    }

    #[must_use]
    pub fn cached_query(&self, name: &str) -> Option<&CachedQueryDef> {
        self.cached_queries.get(name)
    }

    #[must_use]
    pub fn cached_queries(&self) -> &BTreeMap<String, CachedQueryDef> {
        &self.cached_queries
    }

    #[must_use]
    pub const fn has_fake_delete(&self) -> bool {
        self.has_fake_delete
    }

    #[must_use]
    pub fn local_cache_code(&self) -> Option<&str> {
        self.local_cache.as_deref()
    }

    #[must_use]
    pub fn redis_cache_code(&self) -> Option<&str> {
        self.redis_cache.as_deref()
    }

    #[must_use]
    pub fn log_queue_code(&self) -> Option<&str> {
        self.log_queue.as_deref()
    }

    #[must_use]
    pub fn log_table(&self) -> &str {
        &self.log_table
    }

    #[must_use]
    pub const fn columns_stamp(&self) -> u32 {
        self.columns_stamp
    }

    /// Entity-by-ID cache key: `<prefix><stamp>:<id>`.
    #[must_use]
    pub fn cache_key(&self, id: u64) -> String {
        format!("{}{}:{}", self.cache_prefix, self.columns_stamp, id)
    }

    /// Cached-query key: `<prefix>_<name>_<fnv32(params)>`.
    #[must_use]
    pub fn cache_key_query(&self, query_name: &str, params: &[DbValue]) -> String {
        let rendered: Vec<String> = params.iter().map(DbValue::canonical).collect();
        let hash = fnv1a_32(format!("[{}]", rendered.join(" ")).as_bytes());
        format!("{}_{}_{}", self.cache_prefix, query_name, hash)
    }

    /// Queue codes to notify for a change touching `changed_columns`
    /// (`None` means "every subscription", used for inserts and deletes).
    #[must_use]
    pub fn dirty_queues_for(&self, changed_columns: Option<&[String]>) -> Vec<String> {
        let mut codes = self.dirty_entity_queues.clone();
        match changed_columns {
            None => {
                for field_codes in self.dirty_field_queues.values() {
                    codes.extend(field_codes.iter().cloned());
                }
            }
            Some(columns) => {
                for column in columns {
                    if let Some(field_codes) = self.dirty_field_queues.get(column) {
                        codes.extend(field_codes.iter().cloned());
                    }
                }
            }
        }
        codes.sort();
        codes.dedup();
        codes
    }

    #[must_use]
    pub fn has_dirty_subscription(&self, code: &str) -> bool {
        self.dirty_entity_queues.iter().any(|c| c == code)
            || self
                .dirty_field_queues
                .values()
                .any(|codes| codes.iter().any(|c| c == code))
    }

    #[must_use]
    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS `{}`", self.table_name)
    }

    #[must_use]
    pub fn truncate_table_sql(&self) -> String {
        format!("TRUNCATE TABLE `{}`", self.table_name)
    }
}

/// Parse a `key[=value];…` tag into a map. A bare key means `"true"`; the
/// value is everything after the first `=` so query templates survive.
#[must_use]
pub(crate) fn parse_tag(tag: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();
    for part in tag.split(';') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => attributes.insert(key.to_string(), value.to_string()),
            None => attributes.insert(part.to_string(), "true".to_string()),
        };
    }
    attributes
}

/// Context the compiler needs from the registry builder.
pub(crate) struct CompileContext<'a> {
    pub entity_names: &'a [String],
    pub pools: &'a [String],
    pub local_caches: &'a [String],
    pub kvs: &'a [String],
    pub dirty_queues: &'a [String],
    pub log_queues: &'a [String],
    pub enums: &'a [String],
}

impl CompileContext<'_> {
    fn has(&self, list: &[String], code: &str) -> bool {
        list.iter().any(|item| item == code)
    }
}

static QUERY_VARIABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z0-9_]+)").expect("static pattern"));

pub(crate) fn compile(
    descriptor: &'static EntityDescriptor,
    ctx: &CompileContext<'_>,
) -> Result<TableSchema> {
    let entity_tag = parse_tag(descriptor.entity_tag);

    let pool_name = entity_tag
        .get("mysql")
        .cloned()
        .unwrap_or_else(|| "default".to_string());
    if !ctx.has(ctx.pools, &pool_name) {
        return Err(OrmError::Validation(format!(
            "unknown mysql pool '{pool_name}'"
        )));
    }

    let table_name = entity_tag
        .get("table")
        .cloned()
        .unwrap_or_else(|| descriptor.name.to_string());

    let local_cache = cache_code(&entity_tag, "localCache");
    if let Some(code) = &local_cache {
        if !ctx.has(ctx.local_caches, code) {
            return Err(OrmError::Validation(format!(
                "unknown local cache pool '{code}'"
            )));
        }
    }
    let redis_cache = cache_code(&entity_tag, "redisCache");
    if let Some(code) = &redis_cache {
        if !ctx.has(ctx.kvs, code) {
            return Err(OrmError::Validation(format!("unknown redis pool '{code}'")));
        }
    }

    let mut columns = Vec::new();
    let mut column_paths = BTreeMap::new();
    let mut one_refs = Vec::new();
    let mut indexes: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();
    let mut uniques: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();
    let mut dirty_field_queues: BTreeMap<String, Vec<String>> = BTreeMap::new();

    flatten_fields(
        descriptor,
        descriptor.fields,
        "",
        ctx,
        &mut columns,
        &mut column_paths,
        &mut one_refs,
        &mut indexes,
        &mut uniques,
        &mut dirty_field_queues,
    )?;

    let has_fake_delete = columns
        .iter()
        .any(|column| column.name == "FakeDelete" && column.kind == ColumnKind::Bool);

    let mut column_names = Vec::with_capacity(columns.len() + 1);
    column_names.push("ID".to_string());
    column_names.extend(columns.iter().map(|column| column.name.clone()));
    let columns_stamp = fnv1a_32(column_names.join(",").as_bytes());

    let mut cache_prefix = String::new();
    if pool_name != "default" {
        cache_prefix.push_str(&pool_name);
    }
    cache_prefix.push_str(&table_name);

    let mut cached_queries = BTreeMap::new();
    for query in descriptor.queries {
        let def = compile_cached_query(descriptor.name, query, has_fake_delete, &columns)?;
        cached_queries.insert(def.name.clone(), def);
    }

    let dirty_entity_queues = queue_codes(&entity_tag, "dirty");
    for code in dirty_entity_queues
        .iter()
        .chain(dirty_field_queues.values().flatten())
    {
        if !ctx.has(ctx.dirty_queues, code) {
            return Err(OrmError::Validation(format!("unknown dirty queue '{code}'")));
        }
    }

    let log_queue = entity_tag.get("log").map(|value| {
        if value == "true" {
            "default".to_string()
        } else {
            value.clone()
        }
    });
    if let Some(code) = &log_queue {
        if !ctx.has(ctx.log_queues, code) {
            return Err(OrmError::Validation(format!("unknown log queue '{code}'")));
        }
    }
    let log_table = format!("_log_{pool_name}_{table_name}");

    Ok(TableSchema {
        entity_name: descriptor.name.to_string(),
        table_name,
        pool_name,
        cache_prefix,
        columns_stamp,
        column_names,
        column_paths,
        columns,
        one_refs,
        indexes: ordered_index_columns(indexes),
        uniques: ordered_index_columns(uniques),
        cached_queries,
        dirty_entity_queues,
        dirty_field_queues,
        log_queue,
        log_table,
        has_fake_delete,
        local_cache,
        redis_cache,
    })
}

fn cache_code(tag: &BTreeMap<String, String>, key: &str) -> Option<String> {
    tag.get(key).map(|value| {
        if value == "true" {
            "default".to_string()
        } else {
            value.clone()
        }
    })
}

fn queue_codes(tag: &BTreeMap<String, String>, key: &str) -> Vec<String> {
    tag.get(key)
        .map(|value| value.split(',').map(str::to_string).collect())
        .unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
fn flatten_fields(
    descriptor: &EntityDescriptor,
    fields: &[FieldDef],
    prefix: &str,
    ctx: &CompileContext<'_>,
    columns: &mut Vec<ColumnMeta>,
    column_paths: &mut BTreeMap<String, String>,
    one_refs: &mut Vec<RefMeta>,
    indexes: &mut BTreeMap<String, Vec<(u32, String)>>,
    uniques: &mut BTreeMap<String, Vec<(u32, String)>>,
    dirty_field_queues: &mut BTreeMap<String, Vec<String>>,
) -> Result<()> {
    for field in fields {
        let attrs = parse_tag(field.tag);
        if attrs.contains_key("ignore") {
            continue;
        }

        if let FieldKind::Embedded { fields: inner } = field.kind {
            let child_prefix = format!("{prefix}{}", field.name);
            flatten_fields(
                descriptor,
                inner,
                &child_prefix,
                ctx,
                columns,
                column_paths,
                one_refs,
                indexes,
                uniques,
                dirty_field_queues,
            )?;
            continue;
        }

        let column_name = format!("{prefix}{}", field.name);
        let dotted = if prefix.is_empty() {
            field.name.to_string()
        } else {
            format!("{}.{}", prefix.trim_end_matches('.'), field.name)
        };

        let mut meta = ColumnMeta {
            name: column_name.clone(),
            kind: ColumnKind::String,
            bits: 32,
            required: attrs.contains_key("required"),
            length: attrs.get("length").cloned(),
            decimal: None,
            precision: None,
            unsigned: attrs.get("unsigned").map(String::as_str) != Some("false"),
            mediumint: attrs.get("mediumint").map(String::as_str) == Some("true"),
            year: attrs.get("year").map(String::as_str) == Some("true"),
            with_time: attrs.get("time").map(String::as_str) == Some("true"),
            values_name: None,
        };

        if let Some(raw) = attrs.get("decimal") {
            let parts: Vec<&str> = raw.split(',').collect();
            let parsed = (parts.first(), parts.get(1));
            match parsed {
                (Some(p), Some(s)) => {
                    let precision = p.parse::<u8>();
                    let scale = s.parse::<u8>();
                    match (precision, scale) {
                        (Ok(p), Ok(s)) => meta.decimal = Some((p, s)),
                        _ => {
                            return Err(OrmError::Validation(format!(
                                "invalid decimal '{raw}' in {}.{column_name}",
                                descriptor.name
                            )));
                        }
                    }
                }
                _ => {
                    return Err(OrmError::Validation(format!(
                        "invalid decimal '{raw}' in {}.{column_name}",
                        descriptor.name
                    )));
                }
            }
        }
        if let Some(raw) = attrs.get("precision") {
            meta.precision = Some(raw.parse::<u8>().map_err(|_| {
                OrmError::Validation(format!(
                    "invalid precision '{raw}' in {}.{column_name}",
                    descriptor.name
                ))
            })?);
        }

        match field.kind {
            FieldKind::Uint { bits } => {
                meta.kind = ColumnKind::Uint;
                meta.bits = bits;
            }
            FieldKind::Int { bits } => {
                meta.kind = ColumnKind::Int;
                meta.bits = bits;
            }
            FieldKind::Float32 => meta.kind = ColumnKind::Float32,
            FieldKind::Float64 => meta.kind = ColumnKind::Float64,
            FieldKind::Bool => meta.kind = ColumnKind::Bool,
            FieldKind::String => meta.kind = ColumnKind::String,
            FieldKind::Bytes => meta.kind = ColumnKind::Bytes,
            FieldKind::Json => meta.kind = ColumnKind::Json,
            FieldKind::Date => meta.kind = ColumnKind::Date,
            FieldKind::Enum => {
                meta.kind = ColumnKind::Enum;
                let name = attrs.get("enum").cloned().ok_or_else(|| {
                    OrmError::Validation(format!(
                        "missing enum name in {}.{column_name}",
                        descriptor.name
                    ))
                })?;
                if !ctx.has(ctx.enums, &name) {
                    return Err(OrmError::Validation(format!("unknown enum '{name}'")));
                }
                meta.values_name = Some(name);
            }
            FieldKind::Set => {
                meta.kind = ColumnKind::Set;
                let name = attrs.get("set").cloned().ok_or_else(|| {
                    OrmError::Validation(format!(
                        "missing set name in {}.{column_name}",
                        descriptor.name
                    ))
                })?;
                if !ctx.has(ctx.enums, &name) {
                    return Err(OrmError::Validation(format!("unknown enum '{name}'")));
                }
                meta.values_name = Some(name);
            }
            FieldKind::Ref { entity } => {
                meta.kind = ColumnKind::Ref;
                if !ctx.has(ctx.entity_names, entity) {
                    return Err(OrmError::EntityNotRegistered {
                        name: entity.to_string(),
                    });
                }
                one_refs.push(RefMeta {
                    column: column_name.clone(),
                    entity: entity.to_string(),
                    cascade: attrs.contains_key("cascade"),
                });
            }
            FieldKind::Embedded { .. } => unreachable!("handled above"),
        }

        let path = if meta.kind == ColumnKind::Ref {
            format!("{dotted}.ID")
        } else {
            dotted
        };
        column_paths.insert(path, column_name.clone());

        for (map, key) in [(&mut *indexes, "index"), (&mut *uniques, "unique")] {
            if let Some(raw) = attrs.get(key) {
                for part in raw.split(',') {
                    let (index_name, position) = match part.split_once(':') {
                        Some((name, pos)) => {
                            let position: u32 = pos.parse().map_err(|_| {
                                OrmError::Validation(format!(
                                    "invalid index position '{pos}' in index '{name}' in {}",
                                    descriptor.name
                                ))
                            })?;
                            if position == 0 {
                                return Err(OrmError::Validation(format!(
                                    "invalid index position '{pos}' in index '{name}' in {}",
                                    descriptor.name
                                )));
                            }
                            (name.to_string(), position)
                        }
                        None => (part.to_string(), 1),
                    };
                    map.entry(index_name)
                        .or_default()
                        .push((position, column_name.clone()));
                }
            }
        }

        for code in queue_codes(&attrs, "dirty") {
            dirty_field_queues
                .entry(column_name.clone())
                .or_default()
                .push(code);
        }

        columns.push(meta);
    }
    Ok(())
}

fn ordered_index_columns(
    raw: BTreeMap<String, Vec<(u32, String)>>,
) -> BTreeMap<String, Vec<String>> {
    raw.into_iter()
        .map(|(name, mut positioned)| {
            positioned.sort_by_key(|(position, _)| *position);
            (
                name,
                positioned.into_iter().map(|(_, column)| column).collect(),
            )
        })
        .collect()
}

fn compile_cached_query(
    entity_name: &str,
    query: &crate::entity::QueryDef,
    has_fake_delete: bool,
    columns: &[ColumnMeta],
) -> Result<CachedQueryDef> {
    let mut fields = Vec::new();
    let mut sql = query.template.to_string();
    let mut variables = 0usize;
    for capture in QUERY_VARIABLE.captures_iter(query.template) {
        variables += 1;
        let field_name = &capture[1];
        if field_name != "ID" {
            if !columns.iter().any(|column| column.name == field_name) {
                return Err(OrmError::Validation(format!(
                    "unknown field '{field_name}' in cached query '{}' in {entity_name}",
                    query.name
                )));
            }
            if !fields.iter().any(|existing| existing == field_name) {
                fields.push(field_name.to_string());
            }
        }
        sql = sql.replacen(&capture[0], &format!("`{field_name}`"), 1);
    }
    if sql.is_empty() {
        sql = "1 ORDER BY `ID`".to_string();
    }

    let attrs = parse_tag(query.tag);
    let max = if query.one {
        1
    } else {
        match attrs.get("max") {
            Some(raw) => raw.parse::<usize>().map_err(|_| {
                OrmError::Validation(format!(
                    "invalid max '{raw}' in cached query '{}' in {entity_name}",
                    query.name
                ))
            })?,
            None => DEFAULT_CACHED_QUERY_MAX,
        }
    };

    Ok(CachedQueryDef {
        name: query.name.to_string(),
        one: query.one,
        max,
        sql,
        fields,
        fake_param: has_fake_delete && variables > 0,
    })
}

/// Enum and set value registrations, shared with DDL generation.
#[derive(Debug, Clone)]
pub struct EnumDef {
    pub values: Vec<String>,
    pub default: Option<String>,
}

impl TableSchema {
    /// Generate the `CREATE TABLE` statement for this schema.
    #[must_use]
    pub fn create_table_ddl(
        &self,
        enums: &HashMap<String, EnumDef>,
        table_for_entity: &HashMap<String, String>,
    ) -> String {
        let mut lines = Vec::new();
        lines.push("  `ID` bigint unsigned NOT NULL AUTO_INCREMENT".to_string());
        for column in &self.columns {
            lines.push(format!("  {}", column_ddl(column, enums)));
        }
        lines.push("  PRIMARY KEY (`ID`)".to_string());
        for (name, columns) in &self.indexes {
            lines.push(format!("  INDEX `{name}` ({})", quote_list(columns)));
        }
        for (name, columns) in &self.uniques {
            lines.push(format!("  UNIQUE INDEX `{name}` ({})", quote_list(columns)));
        }
        for reference in &self.one_refs {
            lines.push(format!("  INDEX `{}` (`{}`)", reference.column, reference.column));
            let referenced = table_for_entity
                .get(&reference.entity)
                .cloned()
                .unwrap_or_else(|| reference.entity.clone());
            let mut constraint = format!(
                "  CONSTRAINT `{}:{}:{}` FOREIGN KEY (`{}`) REFERENCES `{referenced}` (`ID`)",
                self.pool_name, self.table_name, reference.column, reference.column
            );
            if reference.cascade {
                constraint.push_str(" ON DELETE CASCADE");
            }
            lines.push(constraint);
        }
        format!(
            "CREATE TABLE `{}` (\n{}\n) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4",
            self.table_name,
            lines.join(",\n")
        )
    }
}

fn quote_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| format!("`{column}`"))
        .collect::<Vec<_>>()
        .join(",")
}

fn column_ddl(column: &ColumnMeta, enums: &HashMap<String, EnumDef>) -> String {
    let sql_type = column_sql_type(column, enums);
    let constraints = match column.kind {
        ColumnKind::Uint | ColumnKind::Int | ColumnKind::Float32 | ColumnKind::Float64 => {
            " NOT NULL DEFAULT '0'"
        }
        ColumnKind::Bool => " NOT NULL DEFAULT '0'",
        ColumnKind::String | ColumnKind::Set => {
            if column.length.as_deref() == Some("max") {
                " NOT NULL"
            } else {
                " NOT NULL DEFAULT ''"
            }
        }
        ColumnKind::Date | ColumnKind::Enum => {
            if column.required {
                " NOT NULL"
            } else {
                " DEFAULT NULL"
            }
        }
        ColumnKind::Bytes | ColumnKind::Json | ColumnKind::Ref => " DEFAULT NULL",
    };
    format!("`{}` {sql_type}{constraints}", column.name)
}

fn column_sql_type(column: &ColumnMeta, enums: &HashMap<String, EnumDef>) -> String {
    match column.kind {
        ColumnKind::Uint => {
            if column.year {
                "year(4)".to_string()
            } else if column.mediumint {
                "mediumint unsigned".to_string()
            } else {
                format!("{} unsigned", int_base(column.bits))
            }
        }
        ColumnKind::Int => {
            if column.mediumint {
                "mediumint".to_string()
            } else {
                int_base(column.bits).to_string()
            }
        }
        ColumnKind::Float32 => float_type(column, "float"),
        ColumnKind::Float64 => float_type(column, "double"),
        ColumnKind::Bool => "tinyint(1)".to_string(),
        ColumnKind::String => match column.length.as_deref() {
            Some("max") => "mediumtext".to_string(),
            Some(length) => format!("varchar({length})"),
            None => "varchar(255)".to_string(),
        },
        ColumnKind::Bytes => "blob".to_string(),
        ColumnKind::Json => "json".to_string(),
        ColumnKind::Date => {
            if column.with_time {
                "datetime".to_string()
            } else {
                "date".to_string()
            }
        }
        ColumnKind::Enum => values_type("enum", column, enums),
        ColumnKind::Set => values_type("set", column, enums),
        ColumnKind::Ref => "bigint unsigned".to_string(),
    }
}

const fn int_base(bits: u8) -> &'static str {
    match bits {
        8 => "tinyint",
        16 => "smallint",
        24 => "mediumint",
        64 => "bigint",
        _ => "int",
    }
}

fn float_type(column: &ColumnMeta, base: &str) -> String {
    if let Some((precision, scale)) = column.decimal {
        let mut sql = format!("decimal({precision},{scale})");
        if column.unsigned {
            sql.push_str(" unsigned");
        }
        sql
    } else if let Some(precision) = column.precision {
        format!("{base}({precision})")
    } else {
        base.to_string()
    }
}

fn values_type(base: &str, column: &ColumnMeta, enums: &HashMap<String, EnumDef>) -> String {
    let values = column
        .values_name
        .as_ref()
        .and_then(|name| enums.get(name))
        .map(|def| def.values.clone())
        .unwrap_or_default();
    let rendered: Vec<String> = values.into_iter().map(|value| format!("'{value}'")).collect();
    format!("{base}({})", rendered.join(","))
}
