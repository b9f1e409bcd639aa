use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

/// Extension emitted by [`encode`] for migration source refs.
pub const SOURCE_EXTENSION: &str = "sql";

/// Error raised by a migration unit's `up`/`down` body.
pub type UnitError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MigrateError {
    #[error("malformed migration source `{source_ref}`: {reason}")]
    MalformedMigration { source_ref: String, reason: String },
    #[error("malformed migration sources: {}", .offenders.join("; "))]
    MalformedScan { offenders: Vec<String> },
    #[error("unknown target version {version} for location `{location}`")]
    UnknownTargetVersion { location: String, version: u64 },
    #[error("migration source `{source_ref}` for `{location}` v{version} cannot be loaded: {reason}")]
    MigrationLoad { location: String, version: u64, source_ref: String, reason: String },
    #[error("migration `{location}` v{version} failed during {direction}: {reason}")]
    MigrationRuntime { location: String, version: u64, direction: Direction, reason: String },
    #[error("ledger error: {0}")]
    Ledger(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A migration's structured identity. Two migrations are the same migration
/// iff location and version match; the description is informational.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MigrationIdentity {
    pub location: String,
    pub version: u64,
    pub description: String,
}

impl MigrationIdentity {
    #[must_use]
    pub fn key(&self) -> LedgerKey {
        LedgerKey { location: self.location.clone(), version: self.version }
    }
}

/// Map key form of an identity: the description is deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct LedgerKey {
    pub location: String,
    pub version: u64,
}

impl Display for LedgerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "`{}` v{}", self.location, self.version)
    }
}

/// One persisted ledger entry. `applied` flips only through the execution
/// engine; `applied_at` is the audit stamp of the last flip to applied.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationRecord {
    pub identity: MigrationIdentity,
    pub applied: bool,
    pub source_ref: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub applied_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DiscoveredMigration {
    pub source_ref: String,
    pub description: String,
}

/// Scanner output: location -> version -> discovered entry.
pub type DiscoveredSet = BTreeMap<String, BTreeMap<u64, DiscoveredMigration>>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LocationPlan {
    pub location: String,
    pub direction: Direction,
    pub migrations: Vec<MigrationRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TargetVersion {
    Latest,
    Version(u64),
}

impl TargetVersion {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value == "latest" {
            return Some(Self::Latest);
        }
        value.parse::<u64>().ok().map(Self::Version)
    }
}

fn malformed(source_ref: &str, reason: &str) -> MigrateError {
    MigrateError::MalformedMigration {
        source_ref: source_ref.to_string(),
        reason: reason.to_string(),
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_alphanumeric())
}

/// Parse a source ref of the shape `<version>_<location>_<description>.<ext>`
/// into its structured identity.
///
/// # Errors
/// Returns [`MigrateError::MalformedMigration`] for any ref that does not
/// match the shape: missing extension, wrong number of `_`-separated parts,
/// a non-decimal or out-of-range version, or non-alphanumeric location or
/// description.
pub fn decode(source_ref: &str) -> Result<MigrationIdentity, MigrateError> {
    let Some((stem, extension)) = source_ref.rsplit_once('.') else {
        return Err(malformed(source_ref, "missing file extension"));
    };
    if !is_identifier(extension) {
        return Err(malformed(source_ref, "extension must be alphanumeric"));
    }

    let mut parts = stem.splitn(3, '_');
    let (Some(version), Some(location), Some(description)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed(source_ref, "expected <version>_<location>_<description>.<ext>"));
    };

    if version.is_empty() || !version.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(malformed(source_ref, "version must be decimal digits"));
    }
    let Ok(version) = version.parse::<u64>() else {
        return Err(malformed(source_ref, "version does not fit in 64 bits"));
    };
    if !is_identifier(location) {
        return Err(malformed(source_ref, "location must be alphanumeric"));
    }
    if !is_identifier(description) {
        return Err(malformed(source_ref, "description must be alphanumeric"));
    }

    Ok(MigrationIdentity {
        location: location.to_string(),
        version,
        description: description.to_string(),
    })
}

/// Render an identity back into a source ref. For every identity produced by
/// [`decode`], `decode(&encode(&id))` yields `id` again.
#[must_use]
pub fn encode(identity: &MigrationIdentity) -> String {
    format!(
        "{}_{}_{}.{}",
        identity.version, identity.location, identity.description, SOURCE_EXTENSION
    )
}

/// Deterministic UpperCamelCase unit name for an identity, used as the
/// display name of registry-backed migrations.
#[must_use]
pub fn encode_unit_name(identity: &MigrationIdentity) -> String {
    format!(
        "{}{}V{}",
        capitalize(&identity.location),
        capitalize(&identity.description),
        identity.version
    )
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// One executable migration step against a storage connection of type `C`.
pub trait MigrationUnit<C> {
    /// # Errors
    /// Returns the unit's own failure; the surrounding transaction is rolled
    /// back by the caller.
    fn up(&self, conn: &C) -> Result<(), UnitError>;

    /// # Errors
    /// Returns the unit's own failure; the surrounding transaction is rolled
    /// back by the caller.
    fn down(&self, conn: &C) -> Result<(), UnitError>;
}

/// Collaborator that lists available migration sources and loads them into
/// executable units.
pub trait MigrationSource<C> {
    /// # Errors
    /// Returns an error when the underlying listing mechanism fails.
    fn list_available_sources(&self) -> Result<Vec<String>, MigrateError>;

    /// Load one source ref. `Ok(None)` means the ref does not exist (the
    /// caller decides whether that is fatal); `Err` means the source exists
    /// but could not be turned into a unit.
    ///
    /// # Errors
    /// Returns an error when reading or parsing the source fails.
    fn load(&self, source_ref: &str) -> Result<Option<Box<dyn MigrationUnit<C>>>, MigrateError>;
}

/// Persisted record of which migrations are known and applied.
pub trait LedgerStore {
    /// # Errors
    /// Returns [`MigrateError::Ledger`] when the snapshot cannot be read.
    fn fetch_all(&self) -> Result<BTreeMap<LedgerKey, MigrationRecord>, MigrateError>;

    /// # Errors
    /// Returns [`MigrateError::Ledger`] when the record cannot be inserted,
    /// including when its identity already exists.
    fn add(&mut self, record: &MigrationRecord) -> Result<(), MigrateError>;

    /// Refresh description and source ref of an existing record. The source
    /// ref rides along because the description is embedded in it.
    ///
    /// # Errors
    /// Returns [`MigrateError::Ledger`] when no record exists for `key`.
    fn update_description(
        &mut self,
        key: &LedgerKey,
        description: &str,
        source_ref: &str,
    ) -> Result<(), MigrateError>;

    /// # Errors
    /// Returns [`MigrateError::Ledger`] when no record exists for `key`.
    fn delete(&mut self, key: &LedgerKey) -> Result<(), MigrateError>;

    /// Flip the applied flag of an existing record.
    ///
    /// # Errors
    /// Returns [`MigrateError::Ledger`] when no record exists for `key`.
    fn mark(&mut self, key: &LedgerKey, applied: bool) -> Result<(), MigrateError>;

    /// All records for one location, ascending by version.
    ///
    /// # Errors
    /// Returns [`MigrateError::Ledger`] when the rows cannot be read.
    fn records_for_location(&self, location: &str) -> Result<Vec<MigrationRecord>, MigrateError>;

    /// Every location known to the ledger, sorted.
    ///
    /// # Errors
    /// Returns [`MigrateError::Ledger`] when the rows cannot be read.
    fn locations(&self) -> Result<Vec<String>, MigrateError>;
}

/// Outcome of a scoped transaction attempt.
#[derive(Debug)]
pub enum TransactionError {
    /// Begin, commit, or rollback plumbing failed.
    Storage(MigrateError),
    /// The migration unit itself failed; the transaction was rolled back.
    Unit(UnitError),
}

/// Storage collaborator able to run one unit of work transactionally:
/// commit when the closure succeeds, roll back when it fails.
pub trait StorageEngine {
    type Conn;

    /// # Errors
    /// Returns [`TransactionError::Unit`] when `work` fails (after rollback)
    /// and [`TransactionError::Storage`] when the transaction plumbing fails.
    fn with_transaction(
        &mut self,
        work: &mut dyn FnMut(&Self::Conn) -> Result<(), UnitError>,
    ) -> Result<(), TransactionError>;
}

type UnitFactory<C> = Box<dyn Fn() -> Box<dyn MigrationUnit<C>> + Send + Sync>;

/// Lookup table mapping encoded identities to unit factories, for migrations
/// defined in code rather than on disk. Implements [`MigrationSource`], so a
/// registry can feed the scanner and the execution engine directly.
pub struct MigrationRegistry<C> {
    factories: BTreeMap<String, UnitFactory<C>>,
}

impl<C> MigrationRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self { factories: BTreeMap::new() }
    }

    pub fn register<F>(&mut self, identity: &MigrationIdentity, factory: F)
    where
        F: Fn() -> Box<dyn MigrationUnit<C>> + Send + Sync + 'static,
    {
        self.factories.insert(encode(identity), Box::new(factory));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<C> Default for MigrationRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MigrationSource<C> for MigrationRegistry<C> {
    fn list_available_sources(&self) -> Result<Vec<String>, MigrateError> {
        Ok(self.factories.keys().cloned().collect())
    }

    fn load(&self, source_ref: &str) -> Result<Option<Box<dyn MigrationUnit<C>>>, MigrateError> {
        Ok(self.factories.get(source_ref).map(|factory| factory()))
    }
}

/// Walk the migration source and decode every available ref, grouped by
/// location. Read-only.
///
/// The whole scan fails if any ref is undecodable or if two refs collapse to
/// the same location+version; every offender is reported in one error so a
/// bad directory can be fixed in a single pass.
///
/// # Errors
/// Returns [`MigrateError::MalformedScan`] listing all offending refs, or the
/// source's own listing error.
pub fn scan<C>(source: &dyn MigrationSource<C>) -> Result<DiscoveredSet, MigrateError> {
    let mut refs = source.list_available_sources()?;
    refs.sort();

    let mut discovered: DiscoveredSet = BTreeMap::new();
    let mut offenders: Vec<String> = Vec::new();
    for source_ref in refs {
        match decode(&source_ref) {
            Ok(identity) => {
                let versions = discovered.entry(identity.location).or_default();
                match versions.entry(identity.version) {
                    Entry::Vacant(slot) => {
                        slot.insert(DiscoveredMigration {
                            source_ref,
                            description: identity.description,
                        });
                    }
                    Entry::Occupied(existing) => {
                        offenders.push(format!(
                            "{source_ref}: duplicate of {}",
                            existing.get().source_ref
                        ));
                    }
                }
            }
            Err(MigrateError::MalformedMigration { source_ref, reason }) => {
                offenders.push(format!("{source_ref}: {reason}"));
            }
            Err(other) => return Err(other),
        }
    }

    if offenders.is_empty() {
        Ok(discovered)
    } else {
        Err(MigrateError::MalformedScan { offenders })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerMutation {
    Insert { record: MigrationRecord },
    UpdateDescription { key: LedgerKey, description: String, source_ref: String },
    Delete { key: LedgerKey },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failures: Vec<String>,
}

/// Compute the mutations that make the ledger snapshot mirror the discovered
/// set. Pure; mutations touch disjoint keys and carry no ordering dependency.
///
/// Applied records whose source vanished are left untouched: the ledger never
/// forgets a migration that actually ran.
#[must_use]
pub fn diff_ledger(
    discovered: &DiscoveredSet,
    ledger: &BTreeMap<LedgerKey, MigrationRecord>,
) -> Vec<LedgerMutation> {
    let mut mutations = Vec::new();

    for (location, versions) in discovered {
        for (version, found) in versions {
            let key = LedgerKey { location: location.clone(), version: *version };
            match ledger.get(&key) {
                None => mutations.push(LedgerMutation::Insert {
                    record: MigrationRecord {
                        identity: MigrationIdentity {
                            location: location.clone(),
                            version: *version,
                            description: found.description.clone(),
                        },
                        applied: false,
                        source_ref: found.source_ref.clone(),
                        applied_at: None,
                    },
                }),
                Some(existing)
                    if existing.identity.description != found.description
                        || existing.source_ref != found.source_ref =>
                {
                    mutations.push(LedgerMutation::UpdateDescription {
                        key,
                        description: found.description.clone(),
                        source_ref: found.source_ref.clone(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    for (key, record) in ledger {
        let on_disk = discovered
            .get(&key.location)
            .is_some_and(|versions| versions.contains_key(&key.version));
        if !on_disk && !record.applied {
            mutations.push(LedgerMutation::Delete { key: key.clone() });
        }
    }

    mutations
}

/// Apply the diff between `discovered` and the ledger to the ledger store.
///
/// Mutations are applied best-effort: a failing mutation is recorded in the
/// report and the sync continues with the rest, so one bad row never blocks
/// reconciliation of unrelated entries. Callers decide whether a non-empty
/// failure list is fatal.
///
/// # Errors
/// Returns [`MigrateError::Ledger`] only when the initial snapshot cannot be
/// read; individual mutation failures land in [`SyncReport::failures`].
pub fn sync(
    discovered: &DiscoveredSet,
    ledger: &mut dyn LedgerStore,
) -> Result<SyncReport, MigrateError> {
    let snapshot = ledger.fetch_all()?;
    let mut report = SyncReport::default();

    for mutation in diff_ledger(discovered, &snapshot) {
        let outcome = match &mutation {
            LedgerMutation::Insert { record } => ledger.add(record),
            LedgerMutation::UpdateDescription { key, description, source_ref } => {
                ledger.update_description(key, description, source_ref)
            }
            LedgerMutation::Delete { key } => ledger.delete(key),
        };

        match (outcome, mutation) {
            (Ok(()), LedgerMutation::Insert { .. }) => report.inserted += 1,
            (Ok(()), LedgerMutation::UpdateDescription { .. }) => report.updated += 1,
            (Ok(()), LedgerMutation::Delete { .. }) => report.deleted += 1,
            (Err(err), LedgerMutation::Insert { record }) => {
                report.failures.push(format!("insert {}: {err}", record.identity.key()));
            }
            (Err(err), LedgerMutation::UpdateDescription { key, .. }) => {
                report.failures.push(format!("update {key}: {err}"));
            }
            (Err(err), LedgerMutation::Delete { key }) => {
                report.failures.push(format!("delete {key}: {err}"));
            }
        }
    }

    Ok(report)
}

/// Compute the ordered plan per location that moves the ledger from its
/// current state to the requested targets.
///
/// The effective location set is `locations_hint` plus the keys of `targets`;
/// when both are empty, every location known to the ledger is planned. The
/// explicit targets map is authoritative; a bare hint entry only adds its
/// location with default behavior. Locations already at their target are
/// omitted. Planning is fully validated before anything executes.
///
/// # Errors
/// Returns [`MigrateError::UnknownTargetVersion`] when an explicit target
/// version has no ledger record, or the ledger's own read error.
pub fn resolve(
    ledger: &dyn LedgerStore,
    locations_hint: &[String],
    targets: &BTreeMap<String, TargetVersion>,
    default_direction: Direction,
) -> Result<Vec<LocationPlan>, MigrateError> {
    let mut locations: BTreeSet<String> = locations_hint.iter().cloned().collect();
    locations.extend(targets.keys().cloned());
    if locations.is_empty() {
        locations = ledger.locations()?.into_iter().collect();
    }

    let mut plans = Vec::new();
    for location in locations {
        let records = ledger.records_for_location(&location)?;
        let current = records.iter().filter(|r| r.applied).map(|r| r.identity.version).max();
        let latest = records.iter().map(|r| r.identity.version).max();

        let target = match targets.get(&location) {
            Some(TargetVersion::Version(version)) => {
                if !records.iter().any(|r| r.identity.version == *version) {
                    return Err(MigrateError::UnknownTargetVersion {
                        location,
                        version: *version,
                    });
                }
                Some(*version)
            }
            Some(TargetVersion::Latest) => latest,
            None => match default_direction {
                Direction::Up => latest,
                Direction::Down => None,
            },
        };

        match target.cmp(&current) {
            Ordering::Greater => {
                let migrations = records
                    .iter()
                    .filter(|r| {
                        !r.applied
                            && Some(r.identity.version) > current
                            && Some(r.identity.version) <= target
                    })
                    .cloned()
                    .collect();
                plans.push(LocationPlan { location, direction: Direction::Up, migrations });
            }
            Ordering::Less => {
                let mut migrations: Vec<MigrationRecord> = records
                    .iter()
                    .filter(|r| {
                        r.applied
                            && Some(r.identity.version) > target
                            && Some(r.identity.version) <= current
                    })
                    .cloned()
                    .collect();
                migrations.reverse();
                plans.push(LocationPlan { location, direction: Direction::Down, migrations });
            }
            Ordering::Equal => {}
        }
    }

    Ok(plans)
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub applied: Vec<MigrationRecord>,
}

/// Execute the plans in order, one transaction per migration.
///
/// Each step loads its unit from the source, runs `up` or `down` inside a
/// storage transaction, and on success flips the ledger flag (when
/// `record_success` is set). The commit and the ledger flip are two separate
/// operations; a crash between them leaves the ledger one step behind
/// reality, which is accepted. Any failure aborts all remaining work;
/// migrations that already committed stay committed.
///
/// # Errors
/// Returns [`MigrateError::MigrationLoad`] when a planned source ref no
/// longer exists (ledger/disk drift), [`MigrateError::MigrationRuntime`]
/// when a unit fails (its transaction was rolled back), or the storage or
/// ledger error that interrupted the run.
pub fn run<S: StorageEngine>(
    plans: &[LocationPlan],
    record_success: bool,
    source: &dyn MigrationSource<S::Conn>,
    storage: &mut S,
    ledger: &mut dyn LedgerStore,
) -> Result<RunReport, MigrateError> {
    let mut applied = Vec::new();

    for plan in plans {
        for record in &plan.migrations {
            let identity = &record.identity;
            let Some(unit) = source.load(&record.source_ref)? else {
                return Err(MigrateError::MigrationLoad {
                    location: identity.location.clone(),
                    version: identity.version,
                    source_ref: record.source_ref.clone(),
                    reason: "source entry not found".to_string(),
                });
            };

            let direction = plan.direction;
            let mut work = |conn: &S::Conn| match direction {
                Direction::Up => unit.up(conn),
                Direction::Down => unit.down(conn),
            };
            match storage.with_transaction(&mut work) {
                Ok(()) => {}
                Err(TransactionError::Unit(err)) => {
                    return Err(MigrateError::MigrationRuntime {
                        location: identity.location.clone(),
                        version: identity.version,
                        direction,
                        reason: err.to_string(),
                    });
                }
                Err(TransactionError::Storage(err)) => return Err(err),
            }

            let now_applied = direction == Direction::Up;
            if record_success {
                ledger.mark(&identity.key(), now_applied)?;
            }

            let mut done = record.clone();
            done.applied = now_applied;
            applied.push(done);
        }
    }

    Ok(RunReport { run_id: Ulid::new().to_string(), applied })
}
