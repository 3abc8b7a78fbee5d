/*!
The local working copy: a single SQLite database described by a [`StoreSchema`].

Every table carries an `id INTEGER PRIMARY KEY AUTOINCREMENT` column. The
schema is applied idempotently on open, adding any missing tables and
columns, so an old database file or an old raw snapshot is upgraded in place.

All access goes through one connection behind a mutex. Multi-statement
operations run in one transaction while holding it, which is what keeps a
snapshot decode invisible until it commits.
*/

use crate::{RekindleError, Result};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, Transaction};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Name of the primary key column present in every table
pub const PRIMARY_KEY: &str = "id";

/// Keys of the snapshot document that can never be table names
pub const RESERVED_NAMES: [&str; 2] = ["timestamp", "metadata"];

/// One record: column name to scalar value, in column order
pub type Record = Map<String, Value>;

/// A column besides the primary key.
///
/// The declaration must be valid in `ALTER TABLE .. ADD COLUMN`, which rules
/// out `UNIQUE`, `PRIMARY KEY` and non-constant defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub declaration: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Append a column
    pub fn column<N: Into<String>, D: Into<String>>(mut self, name: N, declaration: D) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            declaration: declaration.into(),
        });
        self
    }

    /// True for the primary key and every declared column
    pub fn has_column(&self, name: &str) -> bool {
        name == PRIMARY_KEY || self.columns.iter().any(|c| c.name == name)
    }

    fn create_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\"{}\" INTEGER PRIMARY KEY AUTOINCREMENT",
            self.name, PRIMARY_KEY
        );
        for column in &self.columns {
            sql.push_str(&format!(", \"{}\" {}", column.name, column.declaration));
        }
        sql.push(')');
        sql
    }
}

/// The set of tables the store holds, in snapshot order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSchema {
    /// Written to `PRAGMA user_version` after migration
    pub version: u32,
    pub tables: Vec<TableDef>,
}

impl StoreSchema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: Vec::new(),
        }
    }

    pub fn table(mut self, table: TableDef) -> Self {
        self.tables.push(table);
        self
    }

    /// Look up a table by name
    pub fn table_def(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// The operational dataset: work orders, roster, equipment and access control
    pub fn operations() -> Self {
        StoreSchema::new(1)
            .table(
                TableDef::new("interventions")
                    .column("report_number", "TEXT")
                    .column("year", "INTEGER")
                    .column("exit_time", "TEXT")
                    .column("return_time", "TEXT")
                    .column("address", "TEXT")
                    .column("squad_leader", "TEXT")
                    .column("driver", "TEXT")
                    .column("participants", "TEXT")
                    .column("vehicles_used", "TEXT")
                    .column("created_by", "INTEGER")
                    .column("created_at", "TEXT"),
            )
            .table(
                TableDef::new("personnel")
                    .column("full_name", "TEXT")
                    .column("qualification", "TEXT")
                    .column("license_grade", "TEXT")
                    .column("has_nautical_license", "INTEGER DEFAULT 0")
                    .column("is_active", "INTEGER DEFAULT 1")
                    .column("created_at", "TEXT"),
            )
            .table(
                TableDef::new("vehicles")
                    .column("plate", "TEXT")
                    .column("model", "TEXT")
                    .column("is_active", "INTEGER DEFAULT 1")
                    .column("created_at", "TEXT"),
            )
            .table(
                TableDef::new("users")
                    .column("external_id", "INTEGER")
                    .column("username", "TEXT")
                    .column("full_name", "TEXT")
                    .column("role", "TEXT DEFAULT 'user'")
                    .column("is_active", "INTEGER DEFAULT 1")
                    .column("created_at", "TEXT"),
            )
            .table(
                TableDef::new("access_requests")
                    .column("external_id", "INTEGER")
                    .column("username", "TEXT")
                    .column("full_name", "TEXT")
                    .column("requested_at", "TEXT")
                    .column("status", "TEXT DEFAULT 'pending'"),
            )
            .table(
                TableDef::new("admins")
                    .column("external_id", "INTEGER")
                    .column("added_at", "TEXT"),
            )
    }

    /// Reject names that cannot be safely interpolated or that collide
    /// with the snapshot document's reserved keys
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            check_identifier(&table.name)?;
            if RESERVED_NAMES.contains(&table.name.as_str()) {
                return Err(RekindleError::validation(format!(
                    "table name '{}' is reserved",
                    table.name
                )));
            }
            if !seen.insert(table.name.as_str()) {
                return Err(RekindleError::validation(format!(
                    "duplicate table '{}'",
                    table.name
                )));
            }
            let mut columns = HashSet::new();
            for column in &table.columns {
                check_identifier(&column.name)?;
                if column.name == PRIMARY_KEY || !columns.insert(column.name.as_str()) {
                    return Err(RekindleError::validation(format!(
                        "duplicate column '{}.{}'",
                        table.name, column.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(RekindleError::validation(format!(
            "'{name}' is not a valid identifier"
        )))
    }
}

/// Handle to the local store. Cloning shares the connection.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    schema: Arc<StoreSchema>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .field("tables", &self.schema.tables.len())
            .finish()
    }
}

impl LocalStore {
    /// Open (creating if needed) the database file and apply the schema
    pub fn open<P: AsRef<Path>>(path: P, schema: StoreSchema) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                RekindleError::storage(format!(
                    "Failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::bootstrap(conn, schema, Some(path.to_path_buf()))
    }

    /// An in-memory store, used by tests and dry runs
    pub fn in_memory(schema: StoreSchema) -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?, schema, None)
    }

    fn bootstrap(mut conn: Connection, schema: StoreSchema, path: Option<PathBuf>) -> Result<Self> {
        schema.validate()?;
        migrate(&mut conn, &schema)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            schema: Arc::new(schema),
            path,
        })
    }

    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Database file path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| RekindleError::storage("local store lock poisoned"))
    }

    /// Re-apply the schema. Safe to call any number of times.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.lock()?;
        migrate(&mut conn, &self.schema)
    }

    /// Run `f` against the connection while holding the store lock
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside one transaction; it commits only if `f` succeeds
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Insert one record, returning its id
    pub fn insert(&self, table: &str, record: &Record) -> Result<i64> {
        let def = self.table(table)?;
        self.write(|tx| insert_record(tx, def, record, false))
    }

    /// All records of a table in primary key order
    pub fn records(&self, table: &str) -> Result<Vec<Record>> {
        let def = self.table(table)?;
        self.read(|conn| select_records(conn, def))
    }

    pub fn count(&self, table: &str) -> Result<usize> {
        let def = self.table(table)?;
        self.read(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{}\"", def.name),
                [],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as usize)
        })
    }

    /// Total rows across all schema tables
    pub fn total_rows(&self) -> Result<usize> {
        self.schema
            .tables
            .iter()
            .map(|t| self.count(&t.name))
            .sum()
    }

    fn table(&self, name: &str) -> Result<&TableDef> {
        self.schema
            .table_def(name)
            .ok_or_else(|| RekindleError::validation(format!("unknown table '{name}'")))
    }

    /// Write a consistent copy of the database to `dest`.
    ///
    /// The copy is produced with `VACUUM INTO` next to the destination and
    /// renamed into place, so `dest` is either absent or complete.
    pub fn copy_to(&self, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let staging = staging_path(dest);
        if staging.exists() {
            fs::remove_file(&staging)?;
        }

        let target = staging.to_string_lossy().into_owned();
        self.read(|conn| {
            conn.execute("VACUUM INTO ?1", params![target])?;
            Ok(())
        })?;

        fs::rename(&staging, dest)?;
        debug!(dest = %dest.display(), "Copied local store");
        Ok(())
    }

    /// Raw bytes of a consistent copy of the database
    pub fn export_bytes(&self) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir()?;
        let copy = dir.path().join("export.db");
        self.copy_to(&copy)?;
        Ok(fs::read(&copy)?)
    }

    /// Replace every schema table with the contents of another database file.
    ///
    /// The file is checked with `PRAGMA integrity_check` first. Rows are
    /// copied in one transaction, using the columns both sides have, so the
    /// live store is either fully replaced or untouched.
    pub fn replace_from_file(&self, source: &Path) -> Result<usize> {
        verify_database_file(source)?;

        let mut conn = self.lock()?;
        let source_name = source.to_string_lossy().into_owned();
        conn.execute("ATTACH DATABASE ?1 AS staged", params![source_name])?;
        let copied = copy_from_attached(&mut conn, &self.schema);
        let detached = conn.execute_batch("DETACH DATABASE staged");
        let copied = copied?;
        detached?;

        info!(source = %source.display(), rows = copied, "Replaced local store from file");
        Ok(copied)
    }
}

/// Check that `path` holds an intact SQLite database
pub fn verify_database_file(path: &Path) -> Result<()> {
    let conn = Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let status: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| RekindleError::codec(format!("{} is not a database: {e}", path.display())))?;
    if status == "ok" {
        Ok(())
    } else {
        Err(RekindleError::codec(format!(
            "integrity check of {} failed: {status}",
            path.display()
        )))
    }
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

fn migrate(conn: &mut Connection, schema: &StoreSchema) -> Result<()> {
    let tx = conn.transaction()?;
    for table in &schema.tables {
        tx.execute_batch(&table.create_sql())?;
        let existing = existing_columns(&tx, &table.name, "main")?;
        for column in table.columns.iter().filter(|c| !existing.contains(&c.name)) {
            tx.execute_batch(&format!(
                "ALTER TABLE \"{}\" ADD COLUMN \"{}\" {}",
                table.name, column.name, column.declaration
            ))?;
            debug!(table = %table.name, column = %column.name, "Added missing column");
        }
    }

    let current: u32 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current < schema.version {
        tx.execute_batch(&format!("PRAGMA user_version = {}", schema.version))?;
    }
    tx.commit()?;
    Ok(())
}

fn existing_columns(conn: &Connection, table: &str, database: &str) -> Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1, ?2)")?;
    let names = stmt
        .query_map(params![table, database], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(names)
}

fn copy_from_attached(conn: &mut Connection, schema: &StoreSchema) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut copied = 0;
    let mut matched = 0;
    for table in &schema.tables {
        tx.execute(&format!("DELETE FROM main.\"{}\"", table.name), [])?;

        let available = existing_columns(&tx, &table.name, "staged")?;
        if available.is_empty() {
            continue;
        }
        matched += 1;
        let columns: Vec<String> = std::iter::once(PRIMARY_KEY)
            .chain(table.columns.iter().map(|c| c.name.as_str()))
            .filter(|name| available.contains(*name))
            .map(|name| format!("\"{name}\""))
            .collect();
        let columns = columns.join(", ");
        copied += tx.execute(
            &format!(
                "INSERT INTO main.\"{table}\" ({columns}) SELECT {columns} FROM staged.\"{table}\"",
                table = table.name
            ),
            [],
        )?;
    }
    if matched == 0 && !schema.tables.is_empty() {
        return Err(RekindleError::codec(
            "database file holds none of the store's tables",
        ));
    }
    tx.commit()?;
    Ok(copied)
}

/// Read all records of `table` ordered by primary key.
///
/// Fails with a codec error on REAL or BLOB values.
pub(crate) fn select_records(conn: &Connection, table: &TableDef) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM \"{}\" ORDER BY \"{}\"",
        table.name, PRIMARY_KEY
    ))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query([])?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (index, name) in names.iter().enumerate() {
            let value = sql_to_json(row.get_ref(index)?).map_err(|reason| {
                RekindleError::codec(format!("{}.{name}: {reason}", table.name))
            })?;
            record.insert(name.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

/// Insert one record. With `replace` the row is written with
/// `INSERT OR REPLACE` and must carry an explicit integer id.
pub(crate) fn insert_record(
    conn: &Connection,
    table: &TableDef,
    record: &Record,
    replace: bool,
) -> Result<i64> {
    if replace && !matches!(record.get(PRIMARY_KEY), Some(v) if v.is_i64()) {
        return Err(RekindleError::codec(format!(
            "record in '{}' has no integer '{PRIMARY_KEY}'",
            table.name
        )));
    }

    let mut columns = Vec::with_capacity(record.len());
    let mut values = Vec::with_capacity(record.len());
    for (name, value) in record {
        if !table.has_column(name) {
            return Err(RekindleError::codec(format!(
                "unknown column '{}.{name}'",
                table.name
            )));
        }
        let value = json_to_sql(value)
            .map_err(|reason| RekindleError::codec(format!("{}.{name}: {reason}", table.name)))?;
        columns.push(format!("\"{name}\""));
        values.push(value);
    }

    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    let sql = if columns.is_empty() {
        format!("{verb} INTO \"{}\" DEFAULT VALUES", table.name)
    } else {
        let placeholders = (1..=values.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{verb} INTO \"{}\" ({}) VALUES ({placeholders})",
            table.name,
            columns.join(", ")
        )
    };
    conn.execute(&sql, params_from_iter(values.iter()))?;
    Ok(conn.last_insert_rowid())
}

fn json_to_sql(value: &Value) -> std::result::Result<SqlValue, String> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| format!("number {n} is not a 64-bit integer")),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err("nested values are not supported".to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>) -> std::result::Result<Value, String> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(i) => Ok(Value::from(i)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|s| Value::String(s.to_string()))
            .map_err(|e| format!("text is not UTF-8: {e}")),
        ValueRef::Real(r) => Err(format!("real value {r} is not a supported scalar")),
        ValueRef::Blob(_) => Err("blob values are not supported".to_string()),
    }
}

/// Current `PRAGMA user_version`
pub fn user_version(store: &LocalStore) -> Result<u32> {
    store.read(|conn| {
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))?)
    })
}
