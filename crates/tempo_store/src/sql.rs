//! Relational backend over a sea-orm connection.
//!
//! A dimension `d` is stored as two nullable BIGINT columns, `d_from` and
//! `d_to`, holding microseconds since the Unix epoch; a null bound is open.
//! The column catalog is read once at connect time and kept in memory so
//! that predicate building never has to touch the database.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard};
use std::time::Duration;

use async_trait::async_trait;
use sea_orm::sea_query::{
    Alias, Condition, Expr, MysqlQueryBuilder, PostgresQueryBuilder, Query, QueryStatementWriter,
    SimpleExpr, SqliteQueryBuilder, Value as SeaValue,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
    Statement,
};

use aideon_tempo_core::{Dimension, Interval, TempoError, TempoResult, Timestamp, Value};

use crate::backend::{Backend, Row, period_columns};
use crate::config::TempoConfig;
use crate::predicate::{CompareOp, Predicate};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ColumnKind {
    Integer,
    Real,
    Text,
    Bool,
}

impl ColumnKind {
    fn from_declared(declared: &str) -> Self {
        let declared = declared.to_ascii_uppercase();
        if declared.contains("BOOL") {
            ColumnKind::Bool
        } else if declared.contains("INT") {
            ColumnKind::Integer
        } else if ["REAL", "FLOA", "DOUB", "NUMERIC", "DECIMAL"]
            .iter()
            .any(|marker| declared.contains(marker))
        {
            ColumnKind::Real
        } else {
            ColumnKind::Text
        }
    }
}

#[derive(Clone, Debug)]
struct ColumnInfo {
    name: String,
    kind: ColumnKind,
}

#[derive(Clone, Debug, Default)]
struct TableInfo {
    columns: Vec<ColumnInfo>,
}

impl TableInfo {
    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|info| info.name == column)
    }

    fn has_period(&self, dimension: &Dimension) -> bool {
        let (from, to) = period_columns(dimension);
        self.has_column(&from) && self.has_column(&to)
    }

    /// Dimensions backed by a `_from`/`_to` column pair.
    fn periods(&self) -> Vec<Dimension> {
        self.columns
            .iter()
            .filter_map(|info| info.name.strip_suffix("_from"))
            .map(Dimension::new)
            .filter(|dimension| self.has_period(dimension))
            .collect()
    }
}

pub struct SqlBackend {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    catalog: RwLock<HashMap<String, TableInfo>>,
}

impl std::fmt::Debug for SqlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlBackend")
            .field("backend", &self.backend)
            .finish()
    }
}

impl SqlBackend {
    pub async fn connect(config: &TempoConfig, base_dir: &Path) -> TempoResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        options.sqlx_logging(false);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(TempoError::from)?;
        Self::from_connection(conn).await
    }

    pub async fn from_connection(conn: DatabaseConnection) -> TempoResult<Self> {
        let backend = conn.get_database_backend();
        let store = Self {
            conn,
            backend,
            catalog: RwLock::new(HashMap::new()),
        };
        store.refresh_catalog().await?;
        Ok(store)
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Re-reads table and column metadata, e.g. after migrations ran on this connection.
    pub async fn refresh_catalog(&self) -> TempoResult<()> {
        let catalog = match self.backend {
            DatabaseBackend::Sqlite => self.sqlite_catalog().await?,
            _ => self.information_schema_catalog().await?,
        };
        log::debug!("tempo: catalog has {} tables", catalog.len());
        let mut slot = self
            .catalog
            .write()
            .map_err(|_| TempoError::storage("catalog lock poisoned"))?;
        *slot = catalog;
        Ok(())
    }

    async fn sqlite_catalog(&self) -> TempoResult<HashMap<String, TableInfo>> {
        let tables = self
            .conn
            .query_all(Statement::from_string(
                self.backend,
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
            ))
            .await?;
        let mut catalog = HashMap::new();
        for table in tables {
            let name: String = table.try_get("", "name")?;
            let columns = self
                .conn
                .query_all(Statement::from_string(
                    self.backend,
                    format!("PRAGMA table_info(\"{}\")", name.replace('"', "\"\"")),
                ))
                .await?;
            let mut info = TableInfo::default();
            for column in columns {
                let column_name: String = column.try_get("", "name")?;
                let declared: String = column.try_get("", "type")?;
                info.columns.push(ColumnInfo {
                    name: column_name,
                    kind: ColumnKind::from_declared(&declared),
                });
            }
            catalog.insert(name, info);
        }
        Ok(catalog)
    }

    async fn information_schema_catalog(&self) -> TempoResult<HashMap<String, TableInfo>> {
        let schema = match self.backend {
            DatabaseBackend::MySql => "DATABASE()",
            _ => "current_schema()",
        };
        let rows = self
            .conn
            .query_all(Statement::from_string(
                self.backend,
                format!(
                    "SELECT table_name AS table_name, column_name AS column_name, \
                     data_type AS data_type FROM information_schema.columns \
                     WHERE table_schema = {schema} ORDER BY table_name, ordinal_position"
                ),
            ))
            .await?;
        let mut catalog: HashMap<String, TableInfo> = HashMap::new();
        for row in rows {
            let table: String = row.try_get("", "table_name")?;
            let column: String = row.try_get("", "column_name")?;
            let declared: String = row.try_get("", "data_type")?;
            catalog.entry(table).or_default().columns.push(ColumnInfo {
                name: column,
                kind: ColumnKind::from_declared(&declared),
            });
        }
        Ok(catalog)
    }

    fn read_catalog(&self) -> Option<RwLockReadGuard<'_, HashMap<String, TableInfo>>> {
        self.catalog.read().ok()
    }

    fn table_info(&self, table: &str) -> TempoResult<TableInfo> {
        self.read_catalog()
            .ok_or_else(|| TempoError::storage("catalog lock poisoned"))?
            .get(table)
            .cloned()
            .ok_or_else(|| TempoError::not_found(format!("table '{table}'")))
    }
}

#[async_trait]
impl Backend for SqlBackend {
    fn name(&self) -> &'static str {
        match self.backend {
            DatabaseBackend::Sqlite => "sqlite",
            DatabaseBackend::Postgres => "postgres",
            DatabaseBackend::MySql => "mysql",
            _ => "sql",
        }
    }

    fn has_column(&self, table: &str, column: &str) -> bool {
        self.read_catalog()
            .is_some_and(|catalog| catalog.get(table).is_some_and(|info| info.has_column(column)))
    }

    fn has_period(&self, table: &str, dimension: &Dimension) -> bool {
        self.read_catalog().is_some_and(|catalog| {
            catalog
                .get(table)
                .is_some_and(|info| info.has_period(dimension))
        })
    }

    async fn fetch(
        &self,
        table: &str,
        predicates: &[Predicate],
        limit: Option<u64>,
    ) -> TempoResult<Vec<Row>> {
        let info = self.table_info(table)?;
        let mut select = Query::select();
        select.from(Alias::new(table));
        for column in &info.columns {
            select.column(Alias::new(column.name.as_str()));
        }
        let mut condition = Condition::all();
        for predicate in predicates {
            condition = condition.add(predicate_condition(predicate));
        }
        select.cond_where(condition);
        if let Some(limit) = limit {
            select.limit(limit);
        }
        let rows = query_all(&self.conn, &select).await?;
        let periods = info.periods();
        rows.iter()
            .map(|row| decode_row(row, &info, &periods))
            .collect()
    }
}

fn decode_row(row: &QueryResult, info: &TableInfo, periods: &[Dimension]) -> TempoResult<Row> {
    let mut decoded = Row::new();
    let mut period_names = Vec::with_capacity(periods.len() * 2);
    for dimension in periods {
        let (from, to) = period_columns(dimension);
        let start: Option<i64> = row.try_get("", &from)?;
        let end: Option<i64> = row.try_get("", &to)?;
        let interval = Interval::new(start.map(Timestamp), end.map(Timestamp))?;
        decoded.set_period(dimension.clone(), interval);
        period_names.push(from);
        period_names.push(to);
    }
    for column in &info.columns {
        if period_names.contains(&column.name) {
            continue;
        }
        let value = match column.kind {
            ColumnKind::Integer => Value::from(row.try_get::<Option<i64>>("", &column.name)?),
            ColumnKind::Real => Value::from(row.try_get::<Option<f64>>("", &column.name)?),
            ColumnKind::Bool => Value::from(row.try_get::<Option<bool>>("", &column.name)?),
            ColumnKind::Text => Value::from(row.try_get::<Option<String>>("", &column.name)?),
        };
        decoded.set(column.name.clone(), value);
    }
    Ok(decoded)
}

fn sea_value(value: &Value) -> SeaValue {
    match value {
        Value::Null => SeaValue::String(None),
        Value::Str(text) => SeaValue::from(text.clone()),
        Value::I64(number) => SeaValue::from(*number),
        Value::F64(number) => SeaValue::from(*number),
        Value::Bool(flag) => SeaValue::from(*flag),
        Value::Time(at) => SeaValue::from(at.as_i64()),
    }
}

fn compare_expr(column: &str, op: CompareOp, value: &Value) -> SimpleExpr {
    let col = Expr::col(Alias::new(column));
    if value.is_null() {
        return match op {
            CompareOp::Eq => col.is_null(),
            CompareOp::Ne => col.is_not_null(),
            _ => Expr::cust("1 = 0"),
        };
    }
    let value = sea_value(value);
    match op {
        CompareOp::Eq => col.eq(value),
        CompareOp::Ne => col.ne(value),
        CompareOp::Lt => col.lt(value),
        CompareOp::Lte => col.lte(value),
        CompareOp::Gt => col.gt(value),
        CompareOp::Gte => col.gte(value),
    }
}

/// Renders a predicate with the same semantics `Predicate::matches` has in memory.
fn predicate_condition(predicate: &Predicate) -> Condition {
    match predicate {
        Predicate::Compare { column, op, value } => {
            Condition::all().add(compare_expr(column, *op, value))
        }
        Predicate::In { column, values } => {
            let (nulls, present): (Vec<&Value>, Vec<&Value>) =
                values.iter().partition(|value| value.is_null());
            if present.is_empty() && nulls.is_empty() {
                return Condition::all().add(Expr::cust("1 = 0"));
            }
            let mut any = Condition::any();
            if !present.is_empty() {
                any = any.add(
                    Expr::col(Alias::new(column.as_str()))
                        .is_in(present.into_iter().map(sea_value)),
                );
            }
            if !nulls.is_empty() {
                any = any.add(Expr::col(Alias::new(column.as_str())).is_null());
            }
            any
        }
        Predicate::Contains { dimension, at } => {
            let (from, to) = period_columns(dimension);
            let at = at.as_i64();
            Condition::all()
                .add(
                    Condition::any()
                        .add(Expr::col(Alias::new(from.as_str())).is_null())
                        .add(Expr::col(Alias::new(from.as_str())).lte(at)),
                )
                .add(
                    Condition::any()
                        .add(Expr::col(Alias::new(to.as_str())).is_null())
                        .add(Expr::col(Alias::new(to.as_str())).gt(at)),
                )
        }
        Predicate::And(items) => items
            .iter()
            .fold(Condition::all(), |all, item| all.add(predicate_condition(item))),
        Predicate::Or(items) if items.is_empty() => Condition::all().add(Expr::cust("1 = 0")),
        Predicate::Or(items) => items
            .iter()
            .fold(Condition::any(), |any, item| any.add(predicate_condition(item))),
        Predicate::Not(inner) => predicate_condition(inner).not(),
    }
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> TempoResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    log::debug!("tempo: {sql}");
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

pub(crate) fn build_connection_url(config: &TempoConfig, base_dir: &Path) -> TempoResult<String> {
    match &config.database {
        crate::DatabaseConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        crate::DatabaseConfig::Postgres { url } | crate::DatabaseConfig::Mysql { url } => {
            Ok(url.clone())
        }
        crate::DatabaseConfig::Memory => Err(TempoError::config(
            "the memory backend has no connection url",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{ColumnKind, SqlBackend, build_stmt, predicate_condition};
    use crate::backend::Backend;
    use crate::predicate::{CompareOp, Predicate};
    use aideon_tempo_core::{Dimension, TempoResult, Timestamp, Value};
    use sea_orm::sea_query::{Alias, Query};
    use sea_orm::{ConnectionTrait, Database, DatabaseBackend};
    use tempfile::tempdir;

    fn render(predicate: &Predicate) -> String {
        let mut select = Query::select();
        select
            .column(Alias::new("id"))
            .from(Alias::new("books"))
            .cond_where(predicate_condition(predicate));
        let (sql, values) = build_stmt(DatabaseBackend::Sqlite, &select);
        format!("{sql} {:?}", values.0.len())
    }

    #[test]
    fn declared_types_map_to_kinds() {
        let kinds: BTreeMap<&str, ColumnKind> = [
            ("BIGINT", ColumnKind::Integer),
            ("integer", ColumnKind::Integer),
            ("double precision", ColumnKind::Real),
            ("boolean", ColumnKind::Bool),
            ("TEXT", ColumnKind::Text),
            ("character varying", ColumnKind::Text),
        ]
        .into_iter()
        .collect();
        for (declared, kind) in kinds {
            assert_eq!(ColumnKind::from_declared(declared), kind, "{declared}");
        }
    }

    #[test]
    fn contains_renders_open_bounds() {
        let sql = render(&Predicate::contains(Dimension::new("period"), Timestamp(5)));
        assert!(sql.contains("\"period_from\" IS NULL OR \"period_from\" <= ?"), "{sql}");
        assert!(sql.contains("\"period_to\" IS NULL OR \"period_to\" > ?"), "{sql}");
    }

    #[test]
    fn null_comparisons_and_empty_sets() {
        let sql = render(&Predicate::eq("title", Value::Null));
        assert!(sql.contains("\"title\" IS NULL"), "{sql}");
        let sql = render(&Predicate::is_in("author_id", Vec::new()));
        assert!(sql.contains("1 = 0"), "{sql}");
        let sql = render(&Predicate::compare("pages", CompareOp::Gt, 10_i64));
        assert!(sql.contains("\"pages\" > ?"), "{sql}");
    }

    #[tokio::test]
    async fn introspects_sqlite_periods() -> TempoResult<()> {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("books.sqlite").display());
        let conn = Database::connect(url).await?;
        conn.execute_unprepared(
            "CREATE TABLE books (id INTEGER PRIMARY KEY, title TEXT, \
             period_from BIGINT, period_to BIGINT, edition_from BIGINT)",
        )
        .await?;
        let backend = SqlBackend::from_connection(conn).await?;
        assert!(backend.has_column("books", "title"));
        assert!(backend.has_period("books", &Dimension::new("period")));
        assert!(!backend.has_period("books", &Dimension::new("edition")));

        backend
            .connection()
            .execute_unprepared(
                "INSERT INTO books (id, title, period_from, period_to) VALUES \
                 (1, 'Dune', 0, 10), (1, 'Dune II', 10, NULL)",
            )
            .await?;
        let rows = backend
            .fetch(
                "books",
                &[Predicate::contains(Dimension::new("period"), Timestamp(12))],
                None,
            )
            .await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("title"), Some(&Value::from("Dune II")));
        assert_eq!(rows[0].get("edition_from"), Some(&Value::Null));
        let period = rows[0].period(&Dimension::new("period")).expect("period");
        assert!(period.is_head());
        Ok(())
    }
}
