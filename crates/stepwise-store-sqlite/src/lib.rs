use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use stepwise_core::{
    LedgerKey, LedgerStore, MigrateError, MigrationIdentity, MigrationRecord, MigrationSource,
    MigrationUnit, StorageEngine, TransactionError, UnitError,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CREATE_LEDGER_SQL: &str = r"
CREATE TABLE IF NOT EXISTS migration_ledger (
  location TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 0),
  description TEXT NOT NULL,
  source_ref TEXT NOT NULL,
  applied INTEGER NOT NULL DEFAULT 0 CHECK (applied IN (0, 1)),
  applied_at TEXT,
  PRIMARY KEY (location, version)
);

CREATE INDEX IF NOT EXISTS idx_migration_ledger_applied ON migration_ledger(applied);
";

const UP_MARKER: &str = "-- migrate:up";
const DOWN_MARKER: &str = "-- migrate:down";

fn ledger_err(err: &rusqlite::Error) -> MigrateError {
    MigrateError::Ledger(err.to_string())
}

fn missing(key: &LedgerKey) -> MigrateError {
    MigrateError::Ledger(format!("no ledger record for {key}"))
}

fn version_to_db(version: u64) -> Result<i64, MigrateError> {
    i64::try_from(version)
        .map_err(|_| MigrateError::Ledger(format!("version {version} exceeds sqlite range")))
}

fn rfc3339_now() -> Result<String, MigrateError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|err| MigrateError::Ledger(format!("failed to format timestamp: {err}")))
}

/// SQLite-backed migration ledger.
pub struct SqliteLedger {
    conn: Connection,
}

struct LedgerRow {
    location: String,
    version: i64,
    description: String,
    source_ref: String,
    applied: bool,
    applied_at: Option<String>,
}

const LEDGER_COLUMNS: &str = "location, version, description, source_ref, applied, applied_at";

fn ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerRow> {
    Ok(LedgerRow {
        location: row.get(0)?,
        version: row.get(1)?,
        description: row.get(2)?,
        source_ref: row.get(3)?,
        applied: row.get(4)?,
        applied_at: row.get(5)?,
    })
}

fn into_record(row: LedgerRow) -> Result<MigrationRecord, MigrateError> {
    let version = u64::try_from(row.version).map_err(|_| {
        MigrateError::Ledger(format!(
            "ledger row `{}` v{} has a negative version",
            row.location, row.version
        ))
    })?;
    let applied_at = match row.applied_at {
        Some(text) => Some(OffsetDateTime::parse(&text, &Rfc3339).map_err(|err| {
            MigrateError::Ledger(format!("ledger row has invalid applied_at `{text}`: {err}"))
        })?),
        None => None,
    };

    Ok(MigrationRecord {
        identity: MigrationIdentity {
            location: row.location,
            version,
            description: row.description,
        },
        applied: row.applied,
        source_ref: row.source_ref,
        applied_at,
    })
}

impl SqliteLedger {
    /// Open (and create if necessary) the ledger database, configure runtime
    /// pragmas, and ensure the ledger table exists.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        conn.execute_batch(CREATE_LEDGER_SQL)
            .context("failed to apply migration_ledger table")?;

        Ok(Self { conn })
    }

    fn query_records(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<MigrationRecord>, MigrateError> {
        let mut stmt = self.conn.prepare(sql).map_err(|err| ledger_err(&err))?;
        let rows = stmt
            .query_map(params, ledger_row)
            .map_err(|err| ledger_err(&err))?;

        let mut records = Vec::new();
        for row in rows {
            let row = row.map_err(|err| ledger_err(&err))?;
            records.push(into_record(row)?);
        }
        Ok(records)
    }
}

impl LedgerStore for SqliteLedger {
    fn fetch_all(&self) -> Result<BTreeMap<LedgerKey, MigrationRecord>, MigrateError> {
        let records = self.query_records(
            &format!(
                "SELECT {LEDGER_COLUMNS} FROM migration_ledger ORDER BY location ASC, version ASC"
            ),
            &[],
        )?;
        Ok(records
            .into_iter()
            .map(|record| (record.identity.key(), record))
            .collect())
    }

    fn add(&mut self, record: &MigrationRecord) -> Result<(), MigrateError> {
        let applied_at = match record.applied_at {
            Some(stamp) => Some(stamp.format(&Rfc3339).map_err(|err| {
                MigrateError::Ledger(format!("failed to format applied_at: {err}"))
            })?),
            None => None,
        };
        self.conn
            .execute(
                "INSERT INTO migration_ledger
                    (location, version, description, source_ref, applied, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.identity.location,
                    version_to_db(record.identity.version)?,
                    record.identity.description,
                    record.source_ref,
                    record.applied,
                    applied_at,
                ],
            )
            .map_err(|err| ledger_err(&err))?;
        Ok(())
    }

    fn update_description(
        &mut self,
        key: &LedgerKey,
        description: &str,
        source_ref: &str,
    ) -> Result<(), MigrateError> {
        let changed = self
            .conn
            .execute(
                "UPDATE migration_ledger SET description = ?1, source_ref = ?2
                 WHERE location = ?3 AND version = ?4",
                params![description, source_ref, key.location, version_to_db(key.version)?],
            )
            .map_err(|err| ledger_err(&err))?;
        if changed == 0 {
            return Err(missing(key));
        }
        Ok(())
    }

    fn delete(&mut self, key: &LedgerKey) -> Result<(), MigrateError> {
        let changed = self
            .conn
            .execute(
                "DELETE FROM migration_ledger WHERE location = ?1 AND version = ?2",
                params![key.location, version_to_db(key.version)?],
            )
            .map_err(|err| ledger_err(&err))?;
        if changed == 0 {
            return Err(missing(key));
        }
        Ok(())
    }

    fn mark(&mut self, key: &LedgerKey, applied: bool) -> Result<(), MigrateError> {
        let applied_at = if applied { Some(rfc3339_now()?) } else { None };
        let changed = self
            .conn
            .execute(
                "UPDATE migration_ledger SET applied = ?1, applied_at = ?2
                 WHERE location = ?3 AND version = ?4",
                params![applied, applied_at, key.location, version_to_db(key.version)?],
            )
            .map_err(|err| ledger_err(&err))?;
        if changed == 0 {
            return Err(missing(key));
        }
        Ok(())
    }

    fn records_for_location(&self, location: &str) -> Result<Vec<MigrationRecord>, MigrateError> {
        self.query_records(
            &format!(
                "SELECT {LEDGER_COLUMNS} FROM migration_ledger
                 WHERE location = ?1 ORDER BY version ASC"
            ),
            &[&location],
        )
    }

    fn locations(&self) -> Result<Vec<String>, MigrateError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT location FROM migration_ledger ORDER BY location ASC")
            .map_err(|err| ledger_err(&err))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|err| ledger_err(&err))?;

        let mut locations = Vec::new();
        for row in rows {
            locations.push(row.map_err(|err| ledger_err(&err))?);
        }
        Ok(locations)
    }
}

/// SQLite storage target: each unit of work runs in its own transaction,
/// committed on success and rolled back on failure.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (and create if necessary) the target database and configure
    /// runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StorageEngine for SqliteStorage {
    type Conn = Connection;

    fn with_transaction(
        &mut self,
        work: &mut dyn FnMut(&Connection) -> Result<(), UnitError>,
    ) -> Result<(), TransactionError> {
        let tx = self.conn.unchecked_transaction().map_err(|err| {
            TransactionError::Storage(MigrateError::Storage(format!(
                "failed to begin transaction: {err}"
            )))
        })?;

        match work(&tx) {
            Ok(()) => tx.commit().map_err(|err| {
                TransactionError::Storage(MigrateError::Storage(format!(
                    "failed to commit transaction: {err}"
                )))
            }),
            Err(unit_err) => match tx.rollback() {
                Ok(()) => Err(TransactionError::Unit(unit_err)),
                Err(rollback_err) => Err(TransactionError::Storage(MigrateError::Storage(
                    format!("rollback failed after `{unit_err}`: {rollback_err}"),
                ))),
            },
        }
    }
}

/// One parsed SQL migration script. The up statements are mandatory; scripts
/// without a down section are irreversible.
pub struct SqlScript {
    source_ref: String,
    up: String,
    down: Option<String>,
}

impl MigrationUnit<Connection> for SqlScript {
    fn up(&self, conn: &Connection) -> Result<(), UnitError> {
        conn.execute_batch(&self.up)?;
        Ok(())
    }

    fn down(&self, conn: &Connection) -> Result<(), UnitError> {
        let Some(down) = &self.down else {
            return Err(format!("{} has no down section", self.source_ref).into());
        };
        conn.execute_batch(down)?;
        Ok(())
    }
}

/// Directory of `.sql` migration scripts, one file per migration.
///
/// Scripts split their statements into sections with `-- migrate:up` and
/// `-- migrate:down` comment markers. A script without any marker is treated
/// as a single up-only body.
pub struct SqlScriptSource {
    dir: PathBuf,
}

impl SqlScriptSource {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl MigrationSource<Connection> for SqlScriptSource {
    fn list_available_sources(&self) -> Result<Vec<String>, MigrateError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(MigrateError::Storage(format!(
                    "failed to read migrations directory {}: {err}",
                    self.dir.display()
                )));
            }
        };

        let mut refs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                MigrateError::Storage(format!(
                    "failed to read migrations directory {}: {err}",
                    self.dir.display()
                ))
            })?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.ends_with(".sql") {
                refs.push(name.to_string());
            }
        }
        refs.sort();
        Ok(refs)
    }

    fn load(
        &self,
        source_ref: &str,
    ) -> Result<Option<Box<dyn MigrationUnit<Connection>>>, MigrateError> {
        if source_ref.contains('/') || source_ref.contains('\\') {
            return Err(MigrateError::MalformedMigration {
                source_ref: source_ref.to_string(),
                reason: "source ref must be a bare file name".to_string(),
            });
        }

        let body = match fs::read_to_string(self.dir.join(source_ref)) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(MigrateError::Storage(format!(
                    "failed to read migration script {source_ref}: {err}"
                )));
            }
        };

        Ok(Some(Box::new(parse_script(source_ref, &body)?)))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Up,
    Down,
}

fn parse_script(source_ref: &str, body: &str) -> Result<SqlScript, MigrateError> {
    let malformed = |reason: &str| MigrateError::MalformedMigration {
        source_ref: source_ref.to_string(),
        reason: reason.to_string(),
    };

    if body.trim().is_empty() {
        return Err(malformed("empty migration script"));
    }

    // Markerless script: the whole body is the up step.
    if !body.lines().any(|line| {
        let line = line.trim();
        line == UP_MARKER || line == DOWN_MARKER
    }) {
        return Ok(SqlScript {
            source_ref: source_ref.to_string(),
            up: body.to_string(),
            down: None,
        });
    }

    let mut up = String::new();
    let mut down = String::new();
    let mut seen_down = false;
    let mut section = Section::Preamble;

    for line in body.lines() {
        match line.trim() {
            UP_MARKER => {
                if section != Section::Preamble {
                    return Err(malformed("duplicate `-- migrate:up` marker"));
                }
                section = Section::Up;
            }
            DOWN_MARKER => {
                if seen_down {
                    return Err(malformed("duplicate `-- migrate:down` marker"));
                }
                seen_down = true;
                section = Section::Down;
            }
            _ => match section {
                Section::Preamble => {
                    if !line.trim().is_empty() {
                        return Err(malformed("statements before the first section marker"));
                    }
                }
                Section::Up => {
                    up.push_str(line);
                    up.push('\n');
                }
                Section::Down => {
                    down.push_str(line);
                    down.push('\n');
                }
            },
        }
    }

    if up.trim().is_empty() {
        return Err(malformed("`-- migrate:up` section is empty"));
    }
    let down = if seen_down {
        if down.trim().is_empty() {
            return Err(malformed("`-- migrate:down` section is empty"));
        }
        Some(down)
    } else {
        None
    };

    Ok(SqlScript { source_ref: source_ref.to_string(), up, down })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    use stepwise_core::{resolve, run, scan, sync, Direction};

    use super::*;

    fn open_ledger() -> SqliteLedger {
        match SqliteLedger::open(Path::new(":memory:")) {
            Ok(ledger) => ledger,
            Err(err) => panic!("ledger should open: {err}"),
        }
    }

    fn open_storage() -> SqliteStorage {
        match SqliteStorage::open(Path::new(":memory:")) {
            Ok(storage) => storage,
            Err(err) => panic!("storage should open: {err}"),
        }
    }

    fn record(location: &str, version: u64, description: &str, applied: bool) -> MigrationRecord {
        let identity = MigrationIdentity {
            location: location.to_string(),
            version,
            description: description.to_string(),
        };
        let source_ref = stepwise_core::encode(&identity);
        MigrationRecord { identity, applied, source_ref, applied_at: None }
    }

    fn unique_temp_dir(label: &str) -> PathBuf {
        let nanos = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_nanos(),
            Err(err) => panic!("system clock should be past the epoch: {err}"),
        };
        let dir = std::env::temp_dir().join(format!("stepwise-store-{label}-{nanos}"));
        if let Err(err) = fs::create_dir_all(&dir) {
            panic!("temp dir should be creatable: {err}");
        }
        dir
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        if let Err(err) = fs::write(dir.join(name), body) {
            panic!("script should be writable: {err}");
        }
    }

    #[test]
    fn ledger_round_trips_records() {
        let mut ledger = open_ledger();
        let rec = record("app", 1, "createusers", false);

        if let Err(err) = ledger.add(&rec) {
            panic!("add should succeed: {err}");
        }
        let snapshot = match ledger.fetch_all() {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("fetch_all should succeed: {err}"),
        };

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&rec.identity.key()], rec);
    }

    #[test]
    fn ledger_rejects_duplicate_identity() {
        let mut ledger = open_ledger();
        let rec = record("app", 1, "createusers", false);

        if let Err(err) = ledger.add(&rec) {
            panic!("first add should succeed: {err}");
        }
        let renamed = record("app", 1, "somethingelse", false);
        assert!(matches!(ledger.add(&renamed), Err(MigrateError::Ledger(_))));
    }

    #[test]
    fn ledger_mark_sets_and_clears_applied_at() {
        let mut ledger = open_ledger();
        let rec = record("app", 1, "createusers", false);
        let key = rec.identity.key();

        if let Err(err) = ledger.add(&rec) {
            panic!("add should succeed: {err}");
        }
        if let Err(err) = ledger.mark(&key, true) {
            panic!("mark applied should succeed: {err}");
        }
        let snapshot = match ledger.fetch_all() {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("fetch_all should succeed: {err}"),
        };
        assert!(snapshot[&key].applied);
        assert!(snapshot[&key].applied_at.is_some());

        if let Err(err) = ledger.mark(&key, false) {
            panic!("mark unapplied should succeed: {err}");
        }
        let snapshot = match ledger.fetch_all() {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("fetch_all should succeed: {err}"),
        };
        assert!(!snapshot[&key].applied);
        assert!(snapshot[&key].applied_at.is_none());
    }

    #[test]
    fn ledger_mutations_on_missing_keys_fail() {
        let mut ledger = open_ledger();
        let key = LedgerKey { location: "app".to_string(), version: 9 };

        assert!(matches!(ledger.mark(&key, true), Err(MigrateError::Ledger(_))));
        assert!(matches!(ledger.delete(&key), Err(MigrateError::Ledger(_))));
        assert!(matches!(
            ledger.update_description(&key, "x", "9_app_x.sql"),
            Err(MigrateError::Ledger(_))
        ));
    }

    #[test]
    fn ledger_orders_records_per_location_ascending() {
        let mut ledger = open_ledger();
        for rec in [
            record("app", 3, "c", false),
            record("app", 1, "a", true),
            record("auth", 1, "r", false),
            record("app", 2, "b", true),
        ] {
            if let Err(err) = ledger.add(&rec) {
                panic!("add should succeed: {err}");
            }
        }

        let records = match ledger.records_for_location("app") {
            Ok(records) => records,
            Err(err) => panic!("records_for_location should succeed: {err}"),
        };
        let versions: Vec<u64> = records.iter().map(|r| r.identity.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);

        let locations = match ledger.locations() {
            Ok(locations) => locations,
            Err(err) => panic!("locations should succeed: {err}"),
        };
        assert_eq!(locations, vec!["app".to_string(), "auth".to_string()]);
    }

    #[test]
    fn storage_commits_successful_work() {
        let mut storage = open_storage();

        let outcome = storage.with_transaction(&mut |conn: &Connection| {
            conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY);")?;
            Ok(())
        });
        assert!(outcome.is_ok());

        let count: i64 = match storage.connection().query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 'items'",
            [],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("query should succeed: {err}"),
        };
        assert_eq!(count, 1);
    }

    #[test]
    fn storage_rolls_back_failed_work() {
        let mut storage = open_storage();

        let outcome = storage.with_transaction(&mut |conn: &Connection| {
            conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY);")?;
            Err("late failure".into())
        });

        assert!(matches!(outcome, Err(TransactionError::Unit(_))));
        let count: i64 = match storage.connection().query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 'items'",
            [],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("query should succeed: {err}"),
        };
        assert_eq!(count, 0, "rolled-back DDL must not persist");
    }

    #[test]
    fn script_source_lists_only_sql_files_sorted() {
        let dir = unique_temp_dir("list");
        write_script(&dir, "2_app_b.sql", "CREATE TABLE b (id INTEGER);");
        write_script(&dir, "1_app_a.sql", "CREATE TABLE a (id INTEGER);");
        write_script(&dir, "notes.txt", "not a migration");
        let source = SqlScriptSource::new(&dir);

        let refs = match source.list_available_sources() {
            Ok(refs) => refs,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        assert_eq!(refs, vec!["1_app_a.sql".to_string(), "2_app_b.sql".to_string()]);
    }

    #[test]
    fn script_source_missing_directory_lists_nothing() {
        let source = SqlScriptSource::new(unique_temp_dir("missing").join("nowhere"));
        let refs = match source.list_available_sources() {
            Ok(refs) => refs,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        assert!(refs.is_empty());
    }

    #[test]
    fn script_parsing_splits_up_and_down_sections() {
        let script = match parse_script(
            "1_app_a.sql",
            "-- migrate:up\nCREATE TABLE a (id INTEGER);\n-- migrate:down\nDROP TABLE a;\n",
        ) {
            Ok(script) => script,
            Err(err) => panic!("parse should succeed: {err}"),
        };
        assert_eq!(script.up.trim(), "CREATE TABLE a (id INTEGER);");
        assert_eq!(script.down.as_deref().map(str::trim), Some("DROP TABLE a;"));
    }

    #[test]
    fn script_parsing_treats_markerless_body_as_up_only() {
        let script = match parse_script("1_app_a.sql", "CREATE TABLE a (id INTEGER);\n") {
            Ok(script) => script,
            Err(err) => panic!("parse should succeed: {err}"),
        };
        assert_eq!(script.up.trim(), "CREATE TABLE a (id INTEGER);");
        assert!(script.down.is_none());
    }

    #[test]
    fn script_parsing_rejects_degenerate_scripts() {
        let cases = [
            ("", "empty"),
            ("   \n\n", "whitespace only"),
            ("-- migrate:up\n", "empty up section"),
            ("-- migrate:up\nSELECT 1;\n-- migrate:up\n", "duplicate up marker"),
            (
                "-- migrate:up\nSELECT 1;\n-- migrate:down\n-- migrate:down\n",
                "duplicate down marker",
            ),
            ("-- migrate:up\nSELECT 1;\n-- migrate:down\n  \n", "empty down section"),
        ];
        for (body, label) in cases {
            assert!(
                matches!(
                    parse_script("1_app_a.sql", body),
                    Err(MigrateError::MalformedMigration { .. })
                ),
                "expected MalformedMigration for {label}"
            );
        }
    }

    #[test]
    fn down_without_section_fails_at_execution() {
        let script = match parse_script("1_app_a.sql", "CREATE TABLE a (id INTEGER);\n") {
            Ok(script) => script,
            Err(err) => panic!("parse should succeed: {err}"),
        };
        let storage = open_storage();

        let Err(err) = script.down(storage.connection()) else {
            panic!("down should fail without a down section");
        };
        assert!(err.to_string().contains("no down section"));
    }

    #[test]
    fn scan_sync_run_pipeline_applies_scripts_end_to_end() {
        let dir = unique_temp_dir("pipeline");
        write_script(
            &dir,
            "1_app_createusers.sql",
            "-- migrate:up\nCREATE TABLE users (id INTEGER PRIMARY KEY);\n-- migrate:down\nDROP TABLE users;\n",
        );
        write_script(
            &dir,
            "2_app_addindex.sql",
            "-- migrate:up\nCREATE INDEX idx_users_id ON users(id);\n-- migrate:down\nDROP INDEX idx_users_id;\n",
        );
        let source = SqlScriptSource::new(&dir);
        let mut ledger = open_ledger();
        let mut storage = open_storage();

        let discovered = match scan(&source) {
            Ok(discovered) => discovered,
            Err(err) => panic!("scan should succeed: {err}"),
        };
        let report = match sync(&discovered, &mut ledger) {
            Ok(report) => report,
            Err(err) => panic!("sync should succeed: {err}"),
        };
        assert_eq!(report.inserted, 2);

        let plans = match resolve(&ledger, &[], &BTreeMap::new(), Direction::Up) {
            Ok(plans) => plans,
            Err(err) => panic!("resolve should succeed: {err}"),
        };
        let run_report = match run(&plans, true, &source, &mut storage, &mut ledger) {
            Ok(run_report) => run_report,
            Err(err) => panic!("run should succeed: {err}"),
        };
        assert_eq!(run_report.applied.len(), 2);

        let users_exists: i64 = match storage.connection().query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 'users'",
            [],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("query should succeed: {err}"),
        };
        assert_eq!(users_exists, 1);

        // Nothing left to do once everything is applied.
        let plans = match resolve(&ledger, &[], &BTreeMap::new(), Direction::Up) {
            Ok(plans) => plans,
            Err(err) => panic!("resolve should succeed: {err}"),
        };
        assert!(plans.is_empty());

        // And the whole thing unwinds.
        let plans = match resolve(&ledger, &[], &BTreeMap::new(), Direction::Down) {
            Ok(plans) => plans,
            Err(err) => panic!("resolve should succeed: {err}"),
        };
        if let Err(err) = run(&plans, true, &source, &mut storage, &mut ledger) {
            panic!("down run should succeed: {err}");
        }
        let users_exists: i64 = match storage.connection().query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 'users'",
            [],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("query should succeed: {err}"),
        };
        assert_eq!(users_exists, 0);
    }

    #[test]
    fn failing_script_rolls_back_and_reports_runtime_error() {
        let dir = unique_temp_dir("failfast");
        write_script(
            &dir,
            "1_app_ok.sql",
            "-- migrate:up\nCREATE TABLE ok (id INTEGER);\n-- migrate:down\nDROP TABLE ok;\n",
        );
        write_script(
            &dir,
            "2_app_broken.sql",
            "-- migrate:up\nCREATE TABLE half (id INTEGER);\nTHIS IS NOT SQL;\n",
        );
        let source = SqlScriptSource::new(&dir);
        let mut ledger = open_ledger();
        let mut storage = open_storage();

        let discovered = match scan(&source) {
            Ok(discovered) => discovered,
            Err(err) => panic!("scan should succeed: {err}"),
        };
        if let Err(err) = sync(&discovered, &mut ledger) {
            panic!("sync should succeed: {err}");
        }
        let plans = match resolve(&ledger, &[], &BTreeMap::new(), Direction::Up) {
            Ok(plans) => plans,
            Err(err) => panic!("resolve should succeed: {err}"),
        };

        let outcome = run(&plans, true, &source, &mut storage, &mut ledger);
        let Err(MigrateError::MigrationRuntime { version, direction, .. }) = outcome else {
            panic!("run should fail with MigrationRuntime");
        };
        assert_eq!((version, direction), (2, Direction::Up));

        // The failing script's partial DDL rolled back; the first one stayed.
        let half_exists: i64 = match storage.connection().query_row(
            "SELECT count(*) FROM sqlite_master WHERE name = 'half'",
            [],
            |row| row.get(0),
        ) {
            Ok(count) => count,
            Err(err) => panic!("query should succeed: {err}"),
        };
        assert_eq!(half_exists, 0);

        let snapshot = match ledger.fetch_all() {
            Ok(snapshot) => snapshot,
            Err(err) => panic!("fetch_all should succeed: {err}"),
        };
        assert!(snapshot[&LedgerKey { location: "app".to_string(), version: 1 }].applied);
        assert!(!snapshot[&LedgerKey { location: "app".to_string(), version: 2 }].applied);
    }
}
