//! The audit service.
//!
//! [`Auditor`] ties the pure engine (substitution, resolution, flattening,
//! reconciliation, retention) to its collaborators. Data files for one
//! resolution are read in parallel on the blocking pool and joined back in
//! hierarchy order before reconciliation.

use crate::config::{Config, StorageBackend};
use crate::error::{AuditError, AuditResult};
use crate::flatten::{FlattenedSource, LeafEntry, Value};
use crate::hierarchy::{HieraFile, HierarchyEntry, HierarchyResolution, HierarchyResolver};
use crate::reconcile::{self, DuplicateEntry, KeyPaths, ReconciliationResult};
use crate::retention::{LoggedKeyUsage, RetentionPolicy};
use crate::sources::{
    DataSource, FactProvider, KeyUsageStore, MemoryKeyUsageStore, MemoryResultStore,
    ReconciliationResultStore, YamlDataDir, YamlFactsDir,
};
use crate::substitute::{FactMap, PlaceholderSyntax, Substitutor, UnresolvedFact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Default namespace of `${ns::name}` variables inside data values.
pub const DEFAULT_VARIABLE_NAMESPACE: &str = "hiera_audit";

/// Whole-estate audit, replaced wholesale on every refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstateReport {
    pub generated_at: DateTime<Utc>,
    /// Identities with a lookup log that were audited.
    pub identities: Vec<String>,
    /// Identities with a lookup log but no facts.
    pub skipped_identities: Vec<String>,
    /// Data files never part of any audited identity's hierarchy.
    pub paths_never_used: Vec<String>,
    /// Keys no identity ever looked up.
    pub keys_never_used: Vec<KeyPaths>,
    pub duplicates: Vec<DuplicateEntry>,
}

/// Value of a key as seen by one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyLookup {
    pub key: String,
    /// Highest-priority file defining the key.
    pub path: String,
    /// Value from that file, with `${ns::name}` variables expanded.
    pub value: Value,
    /// Every file defining the key, in priority order.
    pub paths: Vec<String>,
}

/// Lookup log of one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityLog {
    #[serde(rename = "certname")]
    pub identity: String,
    #[serde(rename = "keys")]
    pub entries: Vec<LoggedKeyUsage>,
}

/// Audit facade over the engine and its collaborators.
pub struct Auditor {
    data_dir: String,
    entries: Vec<HierarchyEntry>,
    resolver: HierarchyResolver,
    interpolator: Substitutor,
    retention: RetentionPolicy,
    data: Arc<dyn DataSource>,
    facts: Arc<dyn FactProvider>,
    usage: Arc<dyn KeyUsageStore>,
    results: Arc<dyn ReconciliationResultStore>,
    record_lock: Mutex<()>,
    refreshing: AtomicBool,
}

impl Auditor {
    pub fn new(
        data_dir: impl Into<String>,
        entries: Vec<HierarchyEntry>,
        data: Arc<dyn DataSource>,
        facts: Arc<dyn FactProvider>,
        usage: Arc<dyn KeyUsageStore>,
        results: Arc<dyn ReconciliationResultStore>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            entries,
            resolver: HierarchyResolver::default(),
            interpolator: namespaced(DEFAULT_VARIABLE_NAMESPACE),
            retention: RetentionPolicy::default(),
            data,
            facts,
            usage,
            results,
            record_lock: Mutex::new(()),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Build an auditor from configuration, with on-disk data and facts.
    ///
    /// The stores are passed in so callers choose SQLite or memory.
    pub fn from_config(
        config: &Config,
        usage: Arc<dyn KeyUsageStore>,
        results: Arc<dyn ReconciliationResultStore>,
    ) -> AuditResult<Self> {
        let (data_dir, entries) = match config.hiera_file {
            Some(ref hiera_path) => {
                let hiera = HieraFile::load(hiera_path)?;
                let data_dir = hiera
                    .datadir()
                    .unwrap_or_else(|| config.data_dir.display().to_string());
                (data_dir, hiera.entries())
            }
            None => (config.data_dir.display().to_string(), config.hierarchy.clone()),
        };
        if entries.is_empty() {
            return Err(AuditError::Config(
                "no hierarchy configured, set `hierarchy` or `hiera_file`".to_string(),
            ));
        }
        info!(data_dir = %data_dir, levels = entries.len(), "hierarchy loaded");

        let substitutor = Substitutor::hiera()
            .with_unresolved(config.substitution.policy())
            .with_max_passes(config.substitution.max_passes);

        Ok(Self::new(
            data_dir.clone(),
            entries,
            Arc::new(YamlDataDir::new()),
            Arc::new(YamlFactsDir::new(&config.facts_dir)),
            usage,
            results,
        )
        .with_substitutor(substitutor)
        .with_retention(RetentionPolicy::new(
            config.key_ttl_minutes,
            config.timestamp_format.clone(),
        ))
        .with_variable_namespace(&config.lookup.variable_namespace))
    }

    /// In-memory stores, for storage backend `memory`.
    pub fn memory_stores() -> (Arc<dyn KeyUsageStore>, Arc<dyn ReconciliationResultStore>) {
        (
            Arc::new(MemoryKeyUsageStore::new()),
            Arc::new(MemoryResultStore::new()),
        )
    }

    pub fn with_substitutor(mut self, substitutor: Substitutor) -> Self {
        self.resolver = HierarchyResolver::new(substitutor);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_variable_namespace(mut self, namespace: &str) -> Self {
        self.interpolator = namespaced(namespace);
        self
    }

    pub fn data_dir(&self) -> &str {
        &self.data_dir
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    // -----------------------------------------------------------------------
    // Hierarchy
    // -----------------------------------------------------------------------

    /// Unexpanded path templates plus every referenced fact.
    pub fn hierarchy_overview(&self) -> HierarchyResolution {
        self.resolver.overview(&self.entries, &self.data_dir)
    }

    /// Concrete paths for one identity.
    pub fn resolve_hierarchy(&self, identity: &str) -> AuditResult<HierarchyResolution> {
        let facts = self.require_facts(identity)?;
        Ok(self.resolver.resolution(&self.entries, &self.data_dir, &facts))
    }

    fn require_facts(&self, identity: &str) -> AuditResult<FactMap> {
        let facts = self.facts.facts_for(identity)?;
        if facts.is_empty() {
            return Err(AuditError::identity_not_found(identity));
        }
        Ok(facts)
    }

    /// Read and flatten `paths` in parallel, returned in input order.
    ///
    /// Missing and malformed files come back as empty sources.
    async fn load_sources(&self, paths: &[String]) -> AuditResult<Vec<FlattenedSource>> {
        let mut set = JoinSet::new();
        for (idx, path) in paths.iter().enumerate() {
            let data = Arc::clone(&self.data);
            let path = path.clone();
            set.spawn_blocking(move || (idx, read_source(data.as_ref(), path)));
        }

        let mut slots: Vec<Option<FlattenedSource>> = (0..paths.len()).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            let (idx, source) = joined.map_err(AuditError::internal)?;
            slots[idx] = Some(source);
        }
        Ok(slots.into_iter().flatten().collect())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Reconcile one identity's lookup log against its hierarchy.
    pub async fn reconcile_one(&self, identity: &str) -> AuditResult<ReconciliationResult> {
        let resolution = self.resolve_hierarchy(identity)?;
        let logged = self.usage.get(identity)?;
        let sources = self.load_sources(&resolution.paths).await?;
        let result = reconcile::reconcile(&logged, &sources);
        debug!(
            identity,
            missing = result.logged_not_in_hierarchy.len(),
            found = result.logged_and_in_hierarchy.len(),
            unused = result.in_hierarchy_not_logged.len(),
            duplicates = result.duplicates.len(),
            "reconciled"
        );
        Ok(result)
    }

    /// Audit every identity with a lookup log and publish the report.
    pub async fn reconcile_all(&self) -> AuditResult<EstateReport> {
        let mut all_files: Vec<String> = Vec::new();
        for dir in self.resolver.data_dirs(&self.entries, &self.data_dir) {
            for path in self.data.list_data_files(&dir)? {
                if !all_files.contains(&path) {
                    all_files.push(path);
                }
            }
        }
        let mut report = EstateReport {
            generated_at: Utc::now(),
            ..Default::default()
        };

        let mut logged_keys: HashSet<String> = HashSet::new();
        let mut used_paths: Vec<String> = Vec::new();
        let mut seen_paths: HashSet<String> = HashSet::new();

        for identity in self.usage.identities()? {
            for usage in self.usage.get(&identity)? {
                logged_keys.insert(usage.key);
            }
            let facts = match self.facts.facts_for(&identity) {
                Ok(facts) if !facts.is_empty() => facts,
                Ok(_) => {
                    debug!(identity = %identity, "no facts, skipping");
                    report.skipped_identities.push(identity);
                    continue;
                }
                Err(err) => {
                    warn!(identity = %identity, error = %err, "could not read facts, skipping");
                    report.skipped_identities.push(identity);
                    continue;
                }
            };
            for path in self.resolver.resolve(&self.entries, &self.data_dir, &facts) {
                if seen_paths.insert(path.clone()) {
                    used_paths.push(path);
                }
            }
            report.identities.push(identity);
        }

        report.paths_never_used = all_files
            .into_iter()
            .filter(|p| !seen_paths.contains(p))
            .collect();

        let sources = self.load_sources(&used_paths).await?;
        let leaves: Vec<&LeafEntry> = sources.iter().flat_map(|s| s.leaves.iter()).collect();
        let audit = reconcile::look_for_duplicate_data(leaves.iter().copied(), &logged_keys);
        report.keys_never_used = audit.keys_never_logged;
        report.duplicates = audit.duplicates;

        info!(
            identities = report.identities.len(),
            skipped = report.skipped_identities.len(),
            paths_never_used = report.paths_never_used.len(),
            keys_never_used = report.keys_never_used.len(),
            duplicates = report.duplicates.len(),
            "estate audit complete"
        );
        self.results.replace(report.clone())?;
        Ok(report)
    }

    /// Run [`Auditor::reconcile_all`] in the background.
    ///
    /// Fails with [`AuditError::RefreshInProgress`] while another refresh runs.
    pub fn spawn_refresh(self: &Arc<Self>) -> AuditResult<JoinHandle<AuditResult<EstateReport>>> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AuditError::RefreshInProgress);
        }
        let auditor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = RefreshGuard(&auditor.refreshing);
            let result = auditor.reconcile_all().await;
            if let Err(ref err) = result {
                warn!(error = %err, "estate refresh failed");
            }
            result
        }))
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    /// Latest published estate report.
    pub fn latest_estate(&self) -> AuditResult<EstateReport> {
        self.results.latest()?.ok_or(AuditError::ReportNotFound)
    }

    // -----------------------------------------------------------------------
    // Lookup log
    // -----------------------------------------------------------------------

    /// Record a lookup of `key` by `identity`, pruning expired entries.
    pub fn record_lookup(&self, identity: &str, key: &str) -> AuditResult<Vec<LoggedKeyUsage>> {
        if identity.trim().is_empty() {
            return Err(AuditError::invalid_value("certname", "must not be empty"));
        }
        if key.trim().is_empty() {
            return Err(AuditError::invalid_value("key", "must not be empty"));
        }
        let _lock = self
            .record_lock
            .lock()
            .map_err(|e| AuditError::internal(format!("lookup log lock poisoned: {}", e)))?;

        let existing = self.usage.get(identity)?;
        let merged = self.retention.merge(existing, self.retention.stamp(identity, key));
        self.usage.put(identity, &merged)?;
        debug!(identity, key, entries = merged.len(), "lookup recorded");
        Ok(merged)
    }

    pub fn logged_keys(&self, identity: &str) -> AuditResult<Vec<LoggedKeyUsage>> {
        self.usage.get(identity)
    }

    /// Lookup logs of every identity that has one.
    pub fn all_logs(&self) -> AuditResult<Vec<IdentityLog>> {
        let mut logs = Vec::new();
        for identity in self.usage.identities()? {
            let entries = self.usage.get(&identity)?;
            if !entries.is_empty() {
                logs.push(IdentityLog { identity, entries });
            }
        }
        Ok(logs)
    }

    // -----------------------------------------------------------------------
    // Key lookup
    // -----------------------------------------------------------------------

    /// Value of `key` for `identity`, taken from the first layer defining it.
    ///
    /// String values have `${ns::name}` variables replaced by the first value
    /// of `name` in the same hierarchy; unknown variables are left in place.
    pub async fn lookup_key(&self, identity: &str, key: &str) -> AuditResult<Option<KeyLookup>> {
        let resolution = self.resolve_hierarchy(identity)?;
        let sources = self.load_sources(&resolution.paths).await?;

        let mut defining = sources.iter().filter_map(|s| first_leaf(s, key).map(|l| (s, l)));
        let Some((first, leaf)) = defining.next() else {
            return Ok(None);
        };
        let mut paths = vec![first.path.clone()];
        paths.extend(defining.map(|(s, _)| s.path.clone()));

        let value = self.interpolate(&leaf.value, &sources);
        Ok(Some(KeyLookup {
            key: key.to_string(),
            path: first.path.clone(),
            value,
            paths,
        }))
    }

    fn interpolate(&self, value: &Value, sources: &[FlattenedSource]) -> Value {
        match value {
            Value::String(text) if self.interpolator.has_placeholder(text) => {
                let mut vars = FactMap::new();
                for name in self.interpolator.referenced_facts(text) {
                    let found = sources
                        .iter()
                        .filter_map(|s| first_leaf(s, &name))
                        .find(|l| l.value.is_scalar());
                    if let Some(leaf) = found {
                        vars.insert(name, leaf.value.to_string());
                    }
                }
                Value::String(self.interpolator.expand(text, &vars))
            }
            Value::List(items) => Value::List(items.iter().map(|v| self.interpolate(v, sources)).collect()),
            other => other.clone(),
        }
    }
}

fn namespaced(namespace: &str) -> Substitutor {
    Substitutor::new(PlaceholderSyntax::Namespaced {
        namespace: namespace.to_string(),
    })
    .with_unresolved(UnresolvedFact::Leave)
}

fn first_leaf<'a>(source: &'a FlattenedSource, key: &str) -> Option<&'a LeafEntry> {
    source
        .leaves_for(key)
        .next()
        .or_else(|| source.leaves.iter().find(|l| l.dotted_key() == key))
}

fn read_source(data: &dyn DataSource, path: String) -> FlattenedSource {
    match data.read_structured(&path) {
        Ok(Some(raw)) => FlattenedSource::from_value(path, &raw),
        Ok(None) => {
            debug!(path = %path, "data file not found, treating as empty");
            FlattenedSource::empty(path)
        }
        Err(err) => {
            warn!(path = %path, error = %err, "skipping unreadable data file");
            FlattenedSource::empty(path)
        }
    }
}

/// Clears the refresh flag when the background task ends, even on panic.
struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Stores selected by the storage configuration.
pub fn stores_for(
    config: &Config,
) -> anyhow::Result<(Arc<dyn KeyUsageStore>, Arc<dyn ReconciliationResultStore>)> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Auditor::memory_stores()),
        StorageBackend::Sqlite => {
            let db = Arc::new(crate::db::Database::open(&config.storage.db_path)?);
            let usage: Arc<dyn KeyUsageStore> = db.clone();
            let results: Arc<dyn ReconciliationResultStore> = db;
            Ok((usage, results))
        }
    }
}
