//! User-facing predicate and paging builders.

use crate::value::DbValue;

/// A raw parameterized predicate, optionally carrying `ORDER BY`.
///
/// Column names are written backtick-quoted, placeholders as `?`:
///
/// ```
/// use stratum::{DbValue, Where};
///
/// let adults = Where::new("`Age` >= ? ORDER BY `ID`", vec![DbValue::Uint(18)]);
/// assert_eq!(adults.sql(), "`Age` >= ? ORDER BY `ID`");
/// ```
#[derive(Debug, Clone)]
pub struct Where {
    sql: String,
    params: Vec<DbValue>,
}

impl Where {
    #[must_use]
    pub fn new(sql: impl Into<String>, params: Vec<DbValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// A predicate matching every row.
    #[must_use]
    pub fn all() -> Self {
        Self::new("1", Vec::new())
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn params(&self) -> &[DbValue] {
        &self.params
    }

    /// The predicate with `ORDER BY` stripped, for `count(1)` queries.
    #[must_use]
    pub fn sql_without_order(&self) -> &str {
        match self.sql.find(" ORDER BY ") {
            Some(at) => self.sql[..at].trim_end(),
            None => &self.sql,
        }
    }

    /// Append `AND `FakeDelete` = 0` ahead of any `ORDER BY` clause.
    pub(crate) fn with_fake_delete_filter(&self) -> Self {
        let filtered = match self.sql.find(" ORDER BY ") {
            Some(at) => format!(
                "{} AND `FakeDelete` = 0{}",
                &self.sql[..at],
                &self.sql[at..]
            ),
            None => format!("{} AND `FakeDelete` = 0", self.sql),
        };
        Self {
            sql: filtered,
            params: self.params.clone(),
        }
    }

    pub(crate) fn mentions_fake_delete(&self) -> bool {
        self.sql.contains("FakeDelete")
    }
}

/// 1-based page selection rendered as `LIMIT offset,size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    current_page: usize,
    page_size: usize,
}

impl Pager {
    /// Panics are avoided by clamping `current_page` to at least 1.
    #[must_use]
    pub fn new(current_page: usize, page_size: usize) -> Self {
        Self {
            current_page: current_page.max(1),
            page_size,
        }
    }

    #[must_use]
    pub const fn current_page(&self) -> usize {
        self.current_page
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub const fn offset(&self) -> usize {
        (self.current_page - 1) * self.page_size
    }

    #[must_use]
    pub fn limit_sql(&self) -> String {
        format!(" LIMIT {},{}", self.offset(), self.page_size)
    }
}
