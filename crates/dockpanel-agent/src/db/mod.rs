//! Embedded metadata store.
//!
//! All entity tables share one generic repository layer: option-style [`Filter`]s, `create`,
//! `save`, `update` and `delete`, and pagination. The repository functions take a plain
//! `&rusqlite::Connection` so the same calls work inside [`Db::tx`]; the async methods on [`Db`]
//! are thin wrappers that hop onto the connection thread.

mod accessory;
mod apps;
mod tasks;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rusqlite::{OptionalExtension as _, Row, TransactionBehavior, params_from_iter, types::Value};
use tokio_rusqlite::Connection;

use crate::model::*;

pub use accessory::{AcmeAccountInput, csv_contains};
pub use apps::{CatalogueChanges, CatalogueEntry};
pub use tasks::{TASK_EXECUTING, TASK_FAILED, TASK_SUCCESS};

pub type SqlValue = Value;

/// A persisted entity with an integer primary key named `id`.
pub trait Entity: Sized + Send + 'static {
    const TABLE: &'static str;
    /// Columns after `id`, in [`Entity::values`] order.
    const COLUMNS: &'static [&'static str];
    const PORT_COLUMNS: &'static [&'static str] = &["port"];

    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
    fn values(&self) -> Vec<SqlValue>;
}

macro_rules! entity {
    ($ty:ty, $table:literal, [$($field:ident),+ $(,)?] $(, ports = [$($port:literal),+])?) => {
        impl Entity for $ty {
            const TABLE: &'static str = $table;
            const COLUMNS: &'static [&'static str] = &[$(stringify!($field)),+];
            $(const PORT_COLUMNS: &'static [&'static str] = &[$($port),+];)?

            fn id(&self) -> i64 {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = id;
            }

            fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
                let mut idx = 0usize;
                let mut next = || {
                    idx += 1;
                    idx
                };
                Ok(Self {
                    id: row.get(0)?,
                    $($field: row.get(next())?,)+
                })
            }

            fn values(&self) -> Vec<SqlValue> {
                vec![$(SqlValue::from(self.$field.clone())),+]
            }
        }
    };
}

entity!(App, "apps", [
    key, name, short_desc_zh, short_desc_en, description, icon, readme, kind, resource, limit,
    cross_version_update, status, required_panel_version, memory_required, architectures,
    gpu_support, website, github, document, recommend, last_modified,
]);
entity!(AppDetail, "app_details", [
    app_id, version, docker_compose, params, download_url, download_callback_url, status,
    update, last_modified,
]);
entity!(AppInstall, "app_installs", [
    name, app_id, app_detail_id, version, status, message, service_name, container_name,
    http_port, https_port, env, docker_compose, param, webui, favorite, created_at, updated_at,
], ports = ["http_port", "https_port"]);
entity!(AppInstallResource, "app_install_resources", [
    app_install_id, link_id, resource_id, from, key,
]);
entity!(Database, "databases", [
    name, kind, from, address, port, app_install_id, username, password,
]);
entity!(DatabaseSchema, "database_schemas", [
    name, kind, server_name, from, username, password, format,
]);
entity!(Snapshot, "snapshots", [
    name, version, status, message, interrupt_step, secret, source_account_ids,
    download_account_id, app_data, panel_data, backup_data, with_docker_conf, with_monitor_data,
    with_login_log, with_operation_log, with_task_log, with_system_log, ignore_files, description,
    task_id, created_at,
]);
entity!(BackupRecord, "backup_records", [
    kind, name, detail_name, file_dir, file_name, source_account_ids, download_account_id,
    description, created_at,
]);
entity!(BackupAccount, "backup_accounts", [
    name, kind, bucket, backup_path, vars, access_key, credential,
]);
entity!(AppIgnoreUpgrade, "app_ignore_upgrades", [app_id, app_detail_id, scope]);
entity!(Tag, "tags", [key, name, sort]);
entity!(AppTag, "app_tags", [app_id, tag_id]);
entity!(Launcher, "launchers", [key]);
entity!(AcmeAccount, "acme_accounts", [email, url, kind, eab_kid, eab_hmac_key]);
entity!(WebsiteDomain, "website_domains", [website_id, domain, port]);
entity!(Runtime, "runtimes", [name, kind, port, status]);
entity!(Setting, "settings", [key, value]);

/// Read and delete filters. Several filters are ANDed.
#[derive(Clone, Debug)]
pub enum Filter {
    Id(i64),
    Ids(Vec<i64>),
    Name(String),
    Key(String),
    LikeName(String),
    Type(String),
    DetailName(String),
    AppId(i64),
    Port(i64),
    From(String),
    FileName(String),
    Status(String),
    /// Equality on a trusted column name.
    Eq(&'static str, SqlValue),
    /// Trusted `ORDER BY` fragment, e.g. `created_at DESC`.
    OrderBy(&'static str),
}

struct Query {
    where_sql: String,
    order_sql: String,
    params: Vec<SqlValue>,
}

fn build_query<T: Entity>(filters: &[Filter]) -> Query {
    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let mut order = None;

    fn eq(col: &str, v: SqlValue, clauses: &mut Vec<String>, params: &mut Vec<SqlValue>) {
        params.push(v);
        clauses.push(format!("\"{col}\" = ?{}", params.len()));
    }

    for f in filters {
        match f {
            Filter::Id(id) => eq("id", (*id).into(), &mut clauses, &mut params),
            Filter::Name(v) => eq("name", v.clone().into(), &mut clauses, &mut params),
            Filter::Key(v) => eq("key", v.clone().into(), &mut clauses, &mut params),
            Filter::Type(v) => eq("kind", v.clone().into(), &mut clauses, &mut params),
            Filter::DetailName(v) => eq("detail_name", v.clone().into(), &mut clauses, &mut params),
            Filter::AppId(v) => eq("app_id", (*v).into(), &mut clauses, &mut params),
            Filter::From(v) => eq("from", v.clone().into(), &mut clauses, &mut params),
            Filter::FileName(v) => eq("file_name", v.clone().into(), &mut clauses, &mut params),
            Filter::Status(v) => eq("status", v.clone().into(), &mut clauses, &mut params),
            Filter::Eq(col, v) => eq(col, v.clone(), &mut clauses, &mut params),
            Filter::LikeName(v) => {
                params.push(format!("%{v}%").into());
                clauses.push(format!("\"name\" LIKE ?{}", params.len()));
            }
            Filter::Ids(ids) => {
                if ids.is_empty() {
                    clauses.push("0 = 1".to_string());
                    continue;
                }
                let mut marks = Vec::new();
                for id in ids {
                    params.push((*id).into());
                    marks.push(format!("?{}", params.len()));
                }
                clauses.push(format!("\"id\" IN ({})", marks.join(", ")));
            }
            Filter::Port(port) => {
                params.push((*port).into());
                let idx = params.len();
                let ors = T::PORT_COLUMNS
                    .iter()
                    .map(|c| format!("\"{c}\" = ?{idx}"))
                    .collect::<Vec<_>>();
                clauses.push(format!("({})", ors.join(" OR ")));
            }
            Filter::OrderBy(o) => order = Some(*o),
        }
    }

    Query {
        where_sql: if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        },
        order_sql: format!(" ORDER BY {}", order.unwrap_or("id ASC")),
        params,
    }
}

fn select_columns<T: Entity>() -> String {
    std::iter::once("id")
        .chain(T::COLUMNS.iter().copied())
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn get_first<T: Entity>(
    conn: &rusqlite::Connection,
    filters: &[Filter],
) -> anyhow::Result<Option<T>> {
    let q = build_query::<T>(filters);
    let sql = format!(
        "SELECT {} FROM {}{}{} LIMIT 1",
        select_columns::<T>(),
        T::TABLE,
        q.where_sql,
        q.order_sql
    );
    Ok(conn
        .query_row(&sql, params_from_iter(q.params), |row| T::from_row(row))
        .optional()
        .with_context(|| format!("get {}", T::TABLE))?)
}

pub fn list<T: Entity>(conn: &rusqlite::Connection, filters: &[Filter]) -> anyhow::Result<Vec<T>> {
    let q = build_query::<T>(filters);
    let sql = format!(
        "SELECT {} FROM {}{}{}",
        select_columns::<T>(),
        T::TABLE,
        q.where_sql,
        q.order_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(q.params), |row| T::from_row(row))?;
    Ok(rows
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("list {}", T::TABLE))?)
}

pub fn count<T: Entity>(conn: &rusqlite::Connection, filters: &[Filter]) -> anyhow::Result<i64> {
    let q = build_query::<T>(filters);
    let sql = format!("SELECT COUNT(1) FROM {}{}", T::TABLE, q.where_sql);
    Ok(conn.query_row(&sql, params_from_iter(q.params), |row| row.get(0))?)
}

/// One page (1-based) plus the total row count.
pub fn page<T: Entity>(
    conn: &rusqlite::Connection,
    page: i64,
    size: i64,
    filters: &[Filter],
) -> anyhow::Result<(i64, Vec<T>)> {
    let total = count::<T>(conn, filters)?;
    let q = build_query::<T>(filters);
    let size = size.max(1);
    let offset = (page.max(1) - 1) * size;
    let sql = format!(
        "SELECT {} FROM {}{}{} LIMIT {size} OFFSET {offset}",
        select_columns::<T>(),
        T::TABLE,
        q.where_sql,
        q.order_sql
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(q.params), |row| T::from_row(row))?;
    Ok((total, rows.collect::<Result<Vec<_>, _>>()?))
}

pub fn create<T: Entity>(conn: &rusqlite::Connection, item: &mut T) -> anyhow::Result<i64> {
    let cols = T::COLUMNS
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let marks = (1..=T::COLUMNS.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("INSERT INTO {} ({cols}) VALUES ({marks})", T::TABLE);
    conn.execute(&sql, params_from_iter(item.values()))
        .with_context(|| format!("insert {}", T::TABLE))?;
    let id = conn.last_insert_rowid();
    item.set_id(id);
    Ok(id)
}

/// Inserts when `id == 0`, otherwise rewrites every column of the row.
pub fn save<T: Entity>(conn: &rusqlite::Connection, item: &mut T) -> anyhow::Result<()> {
    if item.id() == 0 {
        create(conn, item)?;
        return Ok(());
    }
    let sets = T::COLUMNS
        .iter()
        .enumerate()
        .map(|(i, c)| format!("\"{c}\" = ?{}", i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let mut values = item.values();
    values.push(item.id().into());
    let sql = format!(
        "UPDATE {} SET {sets} WHERE id = ?{}",
        T::TABLE,
        values.len()
    );
    conn.execute(&sql, params_from_iter(values))
        .with_context(|| format!("save {}", T::TABLE))?;
    Ok(())
}

pub fn update<T: Entity>(
    conn: &rusqlite::Connection,
    id: i64,
    fields: &[(&'static str, SqlValue)],
) -> anyhow::Result<()> {
    if fields.is_empty() {
        return Ok(());
    }
    let mut values = Vec::with_capacity(fields.len() + 1);
    let mut sets = Vec::with_capacity(fields.len());
    for (col, v) in fields {
        if !T::COLUMNS.contains(col) {
            return Err(anyhow::anyhow!("unknown column {col} on {}", T::TABLE));
        }
        values.push(v.clone());
        sets.push(format!("\"{col}\" = ?{}", values.len()));
    }
    values.push(id.into());
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        T::TABLE,
        sets.join(", "),
        values.len()
    );
    conn.execute(&sql, params_from_iter(values))
        .with_context(|| format!("update {}", T::TABLE))?;
    Ok(())
}

/// Deletes matching rows. An empty filter list is refused.
pub fn delete<T: Entity>(conn: &rusqlite::Connection, filters: &[Filter]) -> anyhow::Result<usize> {
    let filters = filters
        .iter()
        .filter(|f| !matches!(f, Filter::OrderBy(_)))
        .cloned()
        .collect::<Vec<_>>();
    if filters.is_empty() {
        return Err(anyhow::anyhow!("refusing to delete all rows of {}", T::TABLE));
    }
    let q = build_query::<T>(&filters);
    let sql = format!("DELETE FROM {}{}", T::TABLE, q.where_sql);
    Ok(conn
        .execute(&sql, params_from_iter(q.params))
        .with_context(|| format!("delete {}", T::TABLE))?)
}

#[derive(Clone)]
pub struct Db {
    conn: Connection,
}

impl Db {
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        let path = ensure_parent_dir(path)?;
        let conn = Connection::open(path).await?;

        let db = Self { conn };
        db.init().await?;
        Ok(db)
    }

    /// Opens an existing database file without creating the schema (e.g. a staged copy).
    pub async fn open_existing(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!("database {} does not exist", path.display()));
        }
        let conn = Connection::open(path.to_path_buf()).await?;
        Ok(Self { conn })
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    pub(crate) async fn call<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(f).await.map_err(|e| match e {
            tokio_rusqlite::Error::Error(inner) => inner,
            other => anyhow::anyhow!(other.to_string()),
        })
    }

    /// Runs `f` inside an immediate transaction; any error rolls it back.
    pub async fn tx<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    async fn init(&self) -> anyhow::Result<()> {
        self.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        self.migrate().await?;
        Ok(())
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        self.call(|conn| {
            ensure_schema_migrations_table(conn)?;
            ensure_snapshot_columns(conn)?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn first<T: Entity>(&self, filters: Vec<Filter>) -> anyhow::Result<Option<T>> {
        self.call(move |conn| get_first::<T>(conn, &filters)).await
    }

    /// Like [`Db::first`] but a missing row is `ErrRecordNotFound`.
    pub async fn must<T: Entity>(&self, filters: Vec<Filter>) -> anyhow::Result<T> {
        self.first::<T>(filters)
            .await?
            .ok_or_else(|| crate::error::PanelError::RecordNotFound.into())
    }

    pub async fn list<T: Entity>(&self, filters: Vec<Filter>) -> anyhow::Result<Vec<T>> {
        self.call(move |conn| list::<T>(conn, &filters)).await
    }

    pub async fn count<T: Entity>(&self, filters: Vec<Filter>) -> anyhow::Result<i64> {
        self.call(move |conn| count::<T>(conn, &filters)).await
    }

    pub async fn page<T: Entity>(
        &self,
        page_no: i64,
        size: i64,
        filters: Vec<Filter>,
    ) -> anyhow::Result<(i64, Vec<T>)> {
        self.call(move |conn| page::<T>(conn, page_no, size, &filters))
            .await
    }

    pub async fn create<T: Entity>(&self, mut item: T) -> anyhow::Result<T> {
        self.call(move |conn| {
            create(conn, &mut item)?;
            Ok(item)
        })
        .await
    }

    pub async fn save<T: Entity + Clone>(&self, item: &mut T) -> anyhow::Result<()> {
        let mut owned = item.clone();
        let saved = self
            .call(move |conn| {
                save(conn, &mut owned)?;
                Ok(owned)
            })
            .await?;
        *item = saved;
        Ok(())
    }

    pub async fn update<T: Entity>(
        &self,
        id: i64,
        fields: Vec<(&'static str, SqlValue)>,
    ) -> anyhow::Result<()> {
        self.call(move |conn| update::<T>(conn, id, &fields)).await
    }

    pub async fn delete<T: Entity>(&self, filters: Vec<Filter>) -> anyhow::Result<usize> {
        self.call(move |conn| delete::<T>(conn, &filters)).await
    }
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<PathBuf> {
    let path = path.to_path_buf();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| format!("create dir {:?}", parent))?;
    }
    Ok(path)
}

fn ensure_schema_migrations_table(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  id TEXT PRIMARY KEY NOT NULL,
  applied_at TEXT NOT NULL
);
"#,
    )?;
    Ok(())
}

/// Snapshot rows restored from older archives may lack the newer selection columns.
fn ensure_snapshot_columns(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    let desired = [
        (
            "with_system_log",
            "ALTER TABLE snapshots ADD COLUMN with_system_log INTEGER NOT NULL DEFAULT 0",
        ),
        (
            "ignore_files",
            "ALTER TABLE snapshots ADD COLUMN ignore_files TEXT NOT NULL DEFAULT ''",
        ),
        (
            "task_id",
            "ALTER TABLE snapshots ADD COLUMN task_id TEXT NOT NULL DEFAULT ''",
        ),
    ];

    let mut stmt = conn.prepare("PRAGMA table_info(snapshots)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let existing = rows.collect::<Result<Vec<_>, _>>()?;

    for (name, ddl) in desired {
        if existing.iter().any(|c| c == name) {
            continue;
        }
        conn.execute_batch(ddl)?;
    }
    Ok(())
}

/// `true` when `table` exists in the database behind `conn`.
pub fn table_exists(conn: &rusqlite::Connection, table: &str) -> anyhow::Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |_row| Ok(()),
        )
        .optional()?
        .is_some())
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS apps (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  "key" TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  short_desc_zh TEXT NOT NULL DEFAULT '',
  short_desc_en TEXT NOT NULL DEFAULT '',
  description TEXT NOT NULL DEFAULT '',
  icon TEXT NOT NULL DEFAULT '',
  readme TEXT NOT NULL DEFAULT '',
  kind TEXT NOT NULL,
  resource TEXT NOT NULL,
  "limit" INTEGER NOT NULL DEFAULT 0,
  cross_version_update INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL,
  required_panel_version REAL NOT NULL DEFAULT 0,
  memory_required INTEGER NOT NULL DEFAULT 0,
  architectures TEXT NOT NULL DEFAULT '',
  gpu_support INTEGER NOT NULL DEFAULT 0,
  website TEXT NOT NULL DEFAULT '',
  github TEXT NOT NULL DEFAULT '',
  document TEXT NOT NULL DEFAULT '',
  recommend INTEGER NOT NULL DEFAULT 0,
  last_modified INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS app_details (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  app_id INTEGER NOT NULL,
  version TEXT NOT NULL,
  docker_compose TEXT NOT NULL DEFAULT '',
  params TEXT NOT NULL DEFAULT '',
  download_url TEXT NOT NULL DEFAULT '',
  download_callback_url TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  "update" INTEGER NOT NULL DEFAULT 0,
  last_modified INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_app_details_app_id ON app_details(app_id);

CREATE TABLE IF NOT EXISTS app_installs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  app_id INTEGER NOT NULL,
  app_detail_id INTEGER NOT NULL,
  version TEXT NOT NULL,
  status TEXT NOT NULL,
  message TEXT NOT NULL DEFAULT '',
  service_name TEXT NOT NULL,
  container_name TEXT NOT NULL DEFAULT '',
  http_port INTEGER NOT NULL DEFAULT 0,
  https_port INTEGER NOT NULL DEFAULT 0,
  env TEXT NOT NULL DEFAULT '',
  docker_compose TEXT NOT NULL DEFAULT '',
  param TEXT NOT NULL DEFAULT '',
  webui TEXT NOT NULL DEFAULT '',
  favorite INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_app_installs_app_id ON app_installs(app_id);

CREATE TABLE IF NOT EXISTS app_install_resources (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  app_install_id INTEGER NOT NULL,
  link_id INTEGER NOT NULL,
  resource_id INTEGER NOT NULL,
  "from" TEXT NOT NULL,
  "key" TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS databases (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  "from" TEXT NOT NULL,
  address TEXT NOT NULL,
  port INTEGER NOT NULL,
  app_install_id INTEGER NOT NULL DEFAULT 0,
  username TEXT NOT NULL DEFAULT '',
  password TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS database_schemas (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  server_name TEXT NOT NULL,
  "from" TEXT NOT NULL,
  username TEXT NOT NULL DEFAULT '',
  password TEXT NOT NULL DEFAULT '',
  format TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS snapshots (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  version TEXT NOT NULL,
  status TEXT NOT NULL,
  message TEXT NOT NULL DEFAULT '',
  interrupt_step TEXT NOT NULL DEFAULT '',
  secret TEXT NOT NULL DEFAULT '',
  source_account_ids TEXT NOT NULL DEFAULT '',
  download_account_id INTEGER NOT NULL DEFAULT 0,
  app_data TEXT NOT NULL DEFAULT '',
  panel_data TEXT NOT NULL DEFAULT '',
  backup_data TEXT NOT NULL DEFAULT '',
  with_docker_conf INTEGER NOT NULL DEFAULT 0,
  with_monitor_data INTEGER NOT NULL DEFAULT 0,
  with_login_log INTEGER NOT NULL DEFAULT 0,
  with_operation_log INTEGER NOT NULL DEFAULT 0,
  with_task_log INTEGER NOT NULL DEFAULT 0,
  description TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY NOT NULL,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  scope TEXT NOT NULL,
  resource_id INTEGER NOT NULL DEFAULT 0,
  current_step TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  error_msg TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
  ts TEXT NOT NULL,
  level TEXT NOT NULL,
  msg TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_task_logs_task_id ON task_logs(task_id);

CREATE TABLE IF NOT EXISTS backup_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  kind TEXT NOT NULL,
  name TEXT NOT NULL,
  detail_name TEXT NOT NULL DEFAULT '',
  file_dir TEXT NOT NULL DEFAULT '',
  file_name TEXT NOT NULL,
  source_account_ids TEXT NOT NULL DEFAULT '',
  download_account_id INTEGER NOT NULL DEFAULT 0,
  description TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backup_accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL UNIQUE,
  kind TEXT NOT NULL,
  bucket TEXT NOT NULL DEFAULT '',
  backup_path TEXT NOT NULL DEFAULT '',
  vars TEXT NOT NULL DEFAULT '',
  access_key TEXT NOT NULL DEFAULT '',
  credential TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS app_ignore_upgrades (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  app_id INTEGER NOT NULL,
  app_detail_id INTEGER NOT NULL DEFAULT 0,
  scope TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  "key" TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  sort INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS app_tags (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  app_id INTEGER NOT NULL,
  tag_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS launchers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  "key" TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS acme_accounts (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  email TEXT NOT NULL,
  url TEXT NOT NULL DEFAULT '',
  kind TEXT NOT NULL,
  eab_kid TEXT NOT NULL DEFAULT '',
  eab_hmac_key TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS website_domains (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  website_id INTEGER NOT NULL DEFAULT 0,
  domain TEXT NOT NULL,
  port INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS runtimes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  kind TEXT NOT NULL,
  port INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS settings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  "key" TEXT NOT NULL UNIQUE,
  value TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS operation_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  source TEXT NOT NULL DEFAULT '',
  action TEXT NOT NULL DEFAULT '',
  detail TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS login_logs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ip TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT '',
  message TEXT NOT NULL DEFAULT '',
  created_at TEXT NOT NULL
);
"#;
