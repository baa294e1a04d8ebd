//! Fixed metadata schema, versioned upgrades and the compatibility check run
//! before the store is opened.
//!
//! The table definitions below are the single source of truth for the current
//! layout. Older databases are brought forward by [`UPGRADE_STEPS`], after
//! which the layout on disk is compared against [`TABLES`]. Differences that
//! can be closed with `CREATE TABLE` or `ALTER TABLE ... ADD COLUMN` are
//! applied; anything else would require dropping a table and is refused.

use super::error::{StorageError, StorageResult};
use sqlx::{Connection, SqliteConnection};
use std::collections::BTreeSet;
use tracing::{debug, error, info};

/// Schema version written by this build.
pub const CURRENT_VERSION: i64 = 3;
/// Oldest on-disk schema this build can upgrade.
pub const MIN_SUPPORTED_VERSION: i64 = 1;

pub struct ColumnDef {
    pub name: &'static str,
    pub sql_type: &'static str,
    pub constraints: &'static str,
}

impl ColumnDef {
    const fn new(name: &'static str, sql_type: &'static str, constraints: &'static str) -> Self {
        Self {
            name,
            sql_type,
            constraints,
        }
    }

    fn is_primary_key(&self) -> bool {
        self.constraints.contains("PRIMARY KEY")
    }

    /// A column can be appended in place if existing rows get a value.
    fn can_be_added(&self) -> bool {
        if self.is_primary_key() || self.constraints.contains("UNIQUE") {
            return false;
        }
        !self.constraints.contains("NOT NULL") || self.constraints.contains("DEFAULT")
    }

    fn ddl(&self) -> String {
        if self.constraints.is_empty() {
            format!("{} {}", self.name, self.sql_type)
        } else {
            format!("{} {} {}", self.name, self.sql_type, self.constraints)
        }
    }
}

pub struct TableDef {
    pub name: &'static str,
    pub columns: &'static [ColumnDef],
    pub table_constraints: &'static [&'static str],
}

impl TableDef {
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnDef::ddl).collect();
        parts.extend(self.table_constraints.iter().map(|c| c.to_string()));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            parts.join(", ")
        )
    }

    fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

pub const TABLES: &[TableDef] = &[
    TableDef {
        name: "users",
        columns: &[
            ColumnDef::new("user_id", "TEXT", "PRIMARY KEY"),
            ColumnDef::new("display_name", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("email", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("created_at", "INTEGER", "NOT NULL DEFAULT 0"),
        ],
        table_constraints: &[],
    },
    TableDef {
        name: "buckets",
        columns: &[
            ColumnDef::new("id", "BLOB", "PRIMARY KEY"),
            ColumnDef::new("name", "TEXT", "NOT NULL"),
            ColumnDef::new("owner_id", "TEXT", "NOT NULL REFERENCES users (user_id)"),
            ColumnDef::new("placement_name", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("placement_storage_class", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("created_at", "INTEGER", "NOT NULL"),
            ColumnDef::new("versioning_enabled", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("deleted", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("attrs", "TEXT", "NOT NULL DEFAULT '{}'"),
        ],
        table_constraints: &[],
    },
    TableDef {
        name: "objects",
        columns: &[
            ColumnDef::new("uuid", "BLOB", "PRIMARY KEY"),
            ColumnDef::new("bucket_id", "BLOB", "NOT NULL REFERENCES buckets (id)"),
            ColumnDef::new("name", "TEXT", "NOT NULL"),
        ],
        table_constraints: &["UNIQUE (bucket_id, name)"],
    },
    TableDef {
        name: "versions",
        columns: &[
            ColumnDef::new("id", "INTEGER", "PRIMARY KEY AUTOINCREMENT"),
            ColumnDef::new("object_id", "BLOB", "NOT NULL REFERENCES objects (uuid)"),
            ColumnDef::new("checksum", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("size", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("create_time", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("delete_time", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("commit_time", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("mtime", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("object_state", "INTEGER", "NOT NULL"),
            ColumnDef::new("version_id", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("etag", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("attrs", "TEXT", "NOT NULL DEFAULT '{}'"),
            ColumnDef::new("version_type", "INTEGER", "NOT NULL DEFAULT 0"),
        ],
        table_constraints: &[],
    },
    TableDef {
        name: "multiparts",
        columns: &[
            ColumnDef::new("id", "INTEGER", "PRIMARY KEY AUTOINCREMENT"),
            ColumnDef::new("bucket_id", "BLOB", "NOT NULL REFERENCES buckets (id)"),
            ColumnDef::new("upload_id", "TEXT", "NOT NULL UNIQUE"),
            ColumnDef::new("state", "INTEGER", "NOT NULL"),
            ColumnDef::new("state_change_time", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("object_name", "TEXT", "NOT NULL"),
            ColumnDef::new("object_uuid", "BLOB", "NOT NULL"),
            ColumnDef::new("meta_str", "TEXT", "NOT NULL"),
            ColumnDef::new("owner_id", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("owner_display_name", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("mtime", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("attrs", "TEXT", "NOT NULL DEFAULT '{}'"),
            ColumnDef::new("placement_name", "TEXT", "NOT NULL DEFAULT ''"),
            ColumnDef::new("placement_storage_class", "TEXT", "NOT NULL DEFAULT ''"),
        ],
        table_constraints: &[],
    },
    TableDef {
        name: "multipart_parts",
        columns: &[
            ColumnDef::new("id", "INTEGER", "PRIMARY KEY AUTOINCREMENT"),
            ColumnDef::new(
                "upload_id",
                "TEXT",
                "NOT NULL REFERENCES multiparts (upload_id)",
            ),
            ColumnDef::new("part_num", "INTEGER", "NOT NULL"),
            ColumnDef::new("size", "INTEGER", "NOT NULL DEFAULT 0"),
            ColumnDef::new("etag", "TEXT", ""),
            ColumnDef::new("mtime", "INTEGER", "NOT NULL DEFAULT 0"),
        ],
        table_constraints: &["UNIQUE (upload_id, part_num)"],
    },
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS versions_object_id_idx ON versions (object_id)",
    "CREATE INDEX IF NOT EXISTS versions_state_idx ON versions (object_state)",
    "CREATE INDEX IF NOT EXISTS multiparts_bucket_meta_idx ON multiparts (bucket_id, meta_str)",
];

/// Layout written by the first release. Kept so upgrades can be exercised.
pub const V1_SCHEMA: &str = r#"
CREATE TABLE users (
    user_id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL DEFAULT '',
    email TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE buckets (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    owner_id TEXT NOT NULL REFERENCES users (user_id),
    placement_name TEXT NOT NULL DEFAULT '',
    placement_storage_class TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    versioning_enabled INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    attrs TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE objects (
    uuid BLOB PRIMARY KEY,
    bucket_id BLOB NOT NULL REFERENCES buckets (id),
    name TEXT NOT NULL,
    UNIQUE (bucket_id, name)
);
CREATE TABLE versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    object_id BLOB NOT NULL REFERENCES objects (uuid),
    checksum TEXT NOT NULL DEFAULT '',
    size INTEGER NOT NULL DEFAULT 0,
    create_time INTEGER NOT NULL DEFAULT 0,
    delete_time INTEGER NOT NULL DEFAULT 0,
    commit_time INTEGER NOT NULL DEFAULT 0,
    mtime INTEGER NOT NULL DEFAULT 0,
    object_state INTEGER NOT NULL,
    version_id TEXT NOT NULL DEFAULT '',
    etag TEXT NOT NULL DEFAULT '',
    attrs TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE multiparts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    bucket_id BLOB NOT NULL REFERENCES buckets (id),
    upload_id TEXT NOT NULL UNIQUE,
    state INTEGER NOT NULL,
    state_change_time INTEGER NOT NULL DEFAULT 0,
    object_name TEXT NOT NULL,
    object_uuid BLOB NOT NULL,
    meta_str TEXT NOT NULL,
    owner_id TEXT NOT NULL DEFAULT '',
    owner_display_name TEXT NOT NULL DEFAULT '',
    mtime INTEGER NOT NULL DEFAULT 0,
    attrs TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE multipart_parts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    upload_id TEXT NOT NULL REFERENCES multiparts (upload_id),
    part_num INTEGER NOT NULL,
    size INTEGER NOT NULL DEFAULT 0,
    etag TEXT,
    mtime INTEGER NOT NULL DEFAULT 0,
    UNIQUE (upload_id, part_num)
);
PRAGMA user_version = 1;
"#;

pub struct UpgradeStep {
    /// Version the database is at once this step ran.
    pub to_version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const UPGRADE_STEPS: &[UpgradeStep] = &[
    UpgradeStep {
        to_version: 2,
        description: "add versions.version_type",
        sql: "ALTER TABLE versions ADD COLUMN version_type INTEGER NOT NULL DEFAULT 0",
    },
    UpgradeStep {
        to_version: 3,
        description: "add multipart destination placement",
        sql: "ALTER TABLE multiparts ADD COLUMN placement_name TEXT NOT NULL DEFAULT '';
              ALTER TABLE multiparts ADD COLUMN placement_storage_class TEXT NOT NULL DEFAULT ''",
    },
];

pub async fn read_user_version(conn: &mut SqliteConnection) -> StorageResult<i64> {
    let version = sqlx::query_scalar::<_, i64>("PRAGMA user_version")
        .fetch_one(conn)
        .await?;
    Ok(version)
}

async fn table_count(conn: &mut SqliteConnection) -> StorageResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_one(conn)
    .await?;
    Ok(count)
}

/// Fail unless `version` lies in the range this build can handle.
pub fn check_version_supported(version: i64) -> StorageResult<()> {
    if version > CURRENT_VERSION {
        return Err(StorageError::IncompatibleSchema(format!(
            "database schema version {} is newer than the supported version {}",
            version, CURRENT_VERSION
        )));
    }
    if version < MIN_SUPPORTED_VERSION {
        return Err(StorageError::IncompatibleSchema(format!(
            "database schema version {} is older than the minimum supported version {}",
            version, MIN_SUPPORTED_VERSION
        )));
    }
    Ok(())
}

/// Difference between the tables on disk and [`TABLES`].
#[derive(Debug, Default)]
pub struct SyncPlan {
    pub statements: Vec<String>,
    pub incompatible: BTreeSet<String>,
}

impl SyncPlan {
    pub fn is_destructive(&self) -> bool {
        !self.incompatible.is_empty()
    }

    fn into_error(self) -> StorageError {
        let tables: Vec<String> = self.incompatible.into_iter().collect();
        StorageError::IncompatibleSchema(format!(
            "Tables: [ {} ] are no longer compatible",
            tables.join(", ")
        ))
    }
}

#[derive(sqlx::FromRow)]
struct ColumnInfo {
    name: String,
    #[sqlx(rename = "type")]
    sql_type: String,
}

pub async fn plan_sync(conn: &mut SqliteConnection) -> StorageResult<SyncPlan> {
    let mut plan = SyncPlan::default();
    for table in TABLES {
        let existing: Vec<ColumnInfo> =
            sqlx::query_as(&format!("PRAGMA table_info('{}')", table.name))
                .fetch_all(&mut *conn)
                .await?;
        if existing.is_empty() {
            plan.statements.push(table.create_sql());
            continue;
        }
        for column in &existing {
            match table.column(&column.name) {
                Some(def) if def.sql_type.eq_ignore_ascii_case(&column.sql_type) => {}
                _ => {
                    plan.incompatible.insert(table.name.to_string());
                }
            }
        }
        for def in table.columns {
            let present = existing
                .iter()
                .any(|c| c.name.eq_ignore_ascii_case(def.name));
            if present {
                continue;
            }
            if def.can_be_added() {
                plan.statements
                    .push(format!("ALTER TABLE {} ADD COLUMN {}", table.name, def.ddl()));
            } else {
                plan.incompatible.insert(table.name.to_string());
            }
        }
    }
    plan.statements.extend(INDEXES.iter().map(|s| s.to_string()));
    Ok(plan)
}

/// Bring the database behind `conn` to [`CURRENT_VERSION`].
///
/// The version number is persisted together with each step, so a crash
/// midway resumes from the last completed step.
pub async fn upgrade(conn: &mut SqliteConnection) -> StorageResult<()> {
    let mut version = read_user_version(conn).await?;
    if version == 0 && table_count(conn).await? == 0 {
        info!("initializing metadata schema at version {}", CURRENT_VERSION);
        let mut tx = conn.begin().await?;
        for table in TABLES {
            sqlx::raw_sql(&table.create_sql()).execute(&mut *tx).await?;
        }
        for index in INDEXES {
            sqlx::raw_sql(index).execute(&mut *tx).await?;
        }
        sqlx::raw_sql(&format!("PRAGMA user_version = {}", CURRENT_VERSION))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok(());
    }

    if let Err(err) = check_version_supported(version) {
        error!("{}", err);
        return Err(err);
    }

    let from = version;
    for step in UPGRADE_STEPS.iter().filter(move |s| s.to_version > from) {
        info!(
            "upgrading metadata schema {} -> {}: {}",
            version, step.to_version, step.description
        );
        let mut tx = conn.begin().await?;
        sqlx::raw_sql(step.sql).execute(&mut *tx).await?;
        sqlx::raw_sql(&format!("PRAGMA user_version = {}", step.to_version))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        version = step.to_version;
    }

    let plan = plan_sync(conn).await?;
    if plan.is_destructive() {
        let err = plan.into_error();
        error!("{}", err);
        return Err(err);
    }
    for stmt in &plan.statements {
        debug!("schema sync: {}", stmt);
        sqlx::raw_sql(stmt).execute(&mut *conn).await?;
    }
    Ok(())
}
