use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use aideon_tempo_core::{Dimension, Interval, TempoError, TempoResult, Value};

use crate::predicate::Predicate;

/// Physical column names backing a dimension's interval: `<dimension>_from` and `<dimension>_to`.
pub fn period_columns(dimension: &Dimension) -> (String, String) {
    (
        format!("{}_from", dimension.as_str()),
        format!("{}_to", dimension.as_str()),
    )
}

/// One stored row version: plain column values plus one interval per backed dimension.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<String, Value>,
    periods: BTreeMap<Dimension, Interval>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }

    pub fn with_period(mut self, dimension: impl Into<Dimension>, interval: Interval) -> Self {
        self.periods.insert(dimension.into(), interval);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn period(&self, dimension: &Dimension) -> Option<&Interval> {
        self.periods.get(dimension)
    }

    pub fn set_period(&mut self, dimension: Dimension, interval: Interval) {
        self.periods.insert(dimension, interval);
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn periods(&self) -> &BTreeMap<Dimension, Interval> {
        &self.periods
    }
}

/// Column introspection and predicate-filtered reads over one store.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn has_column(&self, table: &str, column: &str) -> bool;

    /// Whether `dimension` is backed by a physical interval on `table`.
    fn has_period(&self, table: &str, dimension: &Dimension) -> bool;

    async fn fetch(
        &self,
        table: &str,
        predicates: &[Predicate],
        limit: Option<u64>,
    ) -> TempoResult<Vec<Row>>;
}

#[derive(Debug, Default)]
struct MemoryTable {
    columns: BTreeSet<String>,
    periods: BTreeSet<Dimension>,
    rows: Vec<Row>,
}

/// Row versions held in process; predicates are evaluated in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_tables(&self) -> TempoResult<RwLockReadGuard<'_, HashMap<String, MemoryTable>>> {
        self.tables
            .read()
            .map_err(|_| TempoError::storage("memory backend lock poisoned"))
    }

    fn write_tables(&self) -> TempoResult<RwLockWriteGuard<'_, HashMap<String, MemoryTable>>> {
        self.tables
            .write()
            .map_err(|_| TempoError::storage("memory backend lock poisoned"))
    }

    pub fn create_table<C, D>(&self, table: &str, columns: C, periods: D) -> TempoResult<()>
    where
        C: IntoIterator,
        C::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<Dimension>,
    {
        let mut tables = self.write_tables()?;
        if tables.contains_key(table) {
            return Err(TempoError::invalid(format!("table '{table}' already exists")));
        }
        tables.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.into_iter().map(Into::into).collect(),
                periods: periods.into_iter().map(Into::into).collect(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn insert(&self, table: &str, row: Row) -> TempoResult<()> {
        let mut tables = self.write_tables()?;
        let stored = tables
            .get_mut(table)
            .ok_or_else(|| TempoError::not_found(format!("table '{table}'")))?;
        if let Some(column) = row
            .values()
            .keys()
            .find(|column| !stored.columns.contains(*column))
        {
            return Err(TempoError::invalid(format!(
                "table '{table}' has no column '{column}'"
            )));
        }
        if let Some(dimension) = row
            .periods()
            .keys()
            .find(|dimension| !stored.periods.contains(*dimension))
        {
            return Err(TempoError::invalid(format!(
                "table '{table}' has no period for '{dimension}'"
            )));
        }
        stored.rows.push(row);
        Ok(())
    }

    pub fn row_count(&self, table: &str) -> TempoResult<usize> {
        let tables = self.read_tables()?;
        tables
            .get(table)
            .map(|stored| stored.rows.len())
            .ok_or_else(|| TempoError::not_found(format!("table '{table}'")))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn has_column(&self, table: &str, column: &str) -> bool {
        self.read_tables()
            .map(|tables| {
                tables
                    .get(table)
                    .is_some_and(|stored| stored.columns.contains(column))
            })
            .unwrap_or(false)
    }

    fn has_period(&self, table: &str, dimension: &Dimension) -> bool {
        self.read_tables()
            .map(|tables| {
                tables
                    .get(table)
                    .is_some_and(|stored| stored.periods.contains(dimension))
            })
            .unwrap_or(false)
    }

    async fn fetch(
        &self,
        table: &str,
        predicates: &[Predicate],
        limit: Option<u64>,
    ) -> TempoResult<Vec<Row>> {
        let tables = self.read_tables()?;
        let stored = tables
            .get(table)
            .ok_or_else(|| TempoError::not_found(format!("table '{table}'")))?;
        let limit = limit.map(|limit| limit as usize).unwrap_or(usize::MAX);
        Ok(stored
            .rows
            .iter()
            .filter(|row| predicates.iter().all(|predicate| predicate.matches(row)))
            .take(limit)
            .cloned()
            .collect())
    }
}
