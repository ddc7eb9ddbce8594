use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use eventagg::errors::{StoreError, StoreResult};
use eventagg::store::{Document, DocumentStore, Update};
use nutype::nutype;
use parking_lot::Mutex;
use rand::{random, rngs::StdRng, Rng, SeedableRng};
use tracing::debug;

/// Probability value for failure injection rates.
///
/// Probability represents a value in the range [0.0, 1.0] where 0.0 means
/// never inject failures and 1.0 means always inject failures.
///
/// # Examples
///
/// ```
/// use eventagg_testing::Probability;
///
/// assert!(Probability::try_new(0.5).is_ok());
/// assert!(Probability::try_new(1.5).is_err());
/// assert!(Probability::try_new(-0.1).is_err());
/// ```
#[nutype(
    validate(greater_or_equal = 0.0, less_or_equal = 1.0),
    default = 0.0,
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display, Into, Default)
)]
pub struct Probability(f32);

impl Probability {
    fn clamped(value: f32) -> Self {
        Self::try_new(value.clamp(0.0, 1.0)).unwrap_or_default()
    }
}

/// A single write as seen by a failure predicate.
#[derive(Debug, Clone, Copy)]
pub struct WriteAttempt<'a> {
    /// Target collection.
    pub collection: &'a str,
    /// Target document id.
    pub id: &'a str,
    /// Update being applied.
    pub update: &'a Update,
    /// Whether the write upserts. Compensating writes never do.
    pub upsert: bool,
}

type WritePredicate = Arc<dyn Fn(&WriteAttempt<'_>) -> bool + Send + Sync>;
type ReadPredicate = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Which operations a [`FaultyDocumentStore`] fails.
#[derive(Clone)]
pub struct FaultConfig {
    deterministic_seed: Option<u64>,
    write_failure_probability: Probability,
    read_failure_probability: Probability,
    failing_writes: Vec<WritePredicate>,
    failing_reads: Vec<ReadPredicate>,
}

impl FaultConfig {
    /// Configuration with a fixed seed and no faults.
    pub fn deterministic() -> Self {
        Self {
            deterministic_seed: Some(0),
            ..Self::default()
        }
    }

    /// Fail updates and inserts at random with `probability`.
    #[must_use]
    pub fn with_write_failure_probability(mut self, probability: f32) -> Self {
        self.write_failure_probability = Probability::clamped(probability);
        self
    }

    /// Fail reads at random with `probability`.
    #[must_use]
    pub fn with_read_failure_probability(mut self, probability: f32) -> Self {
        self.read_failure_probability = Probability::clamped(probability);
        self
    }

    /// Always fail updates matching `predicate`.
    #[must_use]
    pub fn fail_writes_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&WriteAttempt<'_>) -> bool + Send + Sync + 'static,
    {
        self.failing_writes.push(Arc::new(predicate));
        self
    }

    /// Always fail reads of `(collection, id)` matching `predicate`.
    #[must_use]
    pub fn fail_reads_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.failing_reads.push(Arc::new(predicate));
        self
    }
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            deterministic_seed: None,
            write_failure_probability: Probability::default(),
            read_failure_probability: Probability::default(),
            failing_writes: Vec::new(),
            failing_reads: Vec::new(),
        }
    }
}

/// Extension trait wrapping a store in a [`FaultyDocumentStore`].
pub trait FaultyDocumentStoreExt: Sized {
    /// Wrap `self` with the given faults.
    fn with_faults(self, config: FaultConfig) -> FaultyDocumentStore<Self>;
}

/// Document store wrapper that injects failures.
pub struct FaultyDocumentStore<S> {
    store: S,
    config: FaultConfig,
    rng: Mutex<StdRng>,
    injected: AtomicUsize,
}

impl<S> FaultyDocumentStore<S> {
    /// Wrap `store`.
    pub fn new(store: S, config: FaultConfig) -> Self {
        let rng = match config.deterministic_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::seed_from_u64(random()),
        };

        Self {
            store,
            config,
            rng: Mutex::new(rng),
            injected: AtomicUsize::new(0),
        }
    }

    /// The wrapped store.
    pub const fn inner(&self) -> &S {
        &self.store
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn should_inject(&self, probability: Probability) -> bool {
        let probability: f32 = probability.into();

        if probability <= 0.0 {
            return false;
        }

        if probability >= 1.0 {
            return true;
        }

        self.rng.lock().random_bool(f64::from(probability))
    }

    fn inject(&self, collection: &str, id: &str, operation: &str) -> StoreError {
        let _ = self.injected.fetch_add(1, Ordering::SeqCst);
        debug!(collection, id, operation, "injecting store failure");
        StoreError::WriteRejected {
            collection: collection.to_string(),
            id: id.to_string(),
            reason: format!("injected {operation} failure"),
        }
    }
}

#[async_trait]
impl<S> DocumentStore for FaultyDocumentStore<S>
where
    S: DocumentStore,
{
    async fn find_one(
        &self,
        collection: &str,
        id: &str,
        projection: &[&str],
    ) -> StoreResult<Option<Document>> {
        let targeted = self
            .config
            .failing_reads
            .iter()
            .any(|predicate| predicate(collection, id));
        if targeted || self.should_inject(self.config.read_failure_probability) {
            let _ = self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(format!(
                "injected read failure for {collection}/{id}"
            )));
        }

        self.store.find_one(collection, id, projection).await
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        update: &Update,
        upsert: bool,
    ) -> StoreResult<()> {
        let attempt = WriteAttempt {
            collection,
            id,
            update,
            upsert,
        };
        let targeted = self
            .config
            .failing_writes
            .iter()
            .any(|predicate| predicate(&attempt));
        if targeted || self.should_inject(self.config.write_failure_probability) {
            return Err(self.inject(collection, id, "update"));
        }

        self.store.update(collection, id, update, upsert).await
    }

    async fn insert(&self, collection: &str, document: Document) -> StoreResult<()> {
        if self.should_inject(self.config.write_failure_probability) {
            return Err(self.inject(collection, "-", "insert"));
        }

        self.store.insert(collection, document).await
    }
}

impl<S> FaultyDocumentStoreExt for S
where
    S: DocumentStore,
{
    fn with_faults(self, config: FaultConfig) -> FaultyDocumentStore<Self> {
        FaultyDocumentStore::new(self, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_config_sets_seed() {
        let default_is_none = FaultConfig::default().deterministic_seed.is_none();
        let deterministic_is_some = FaultConfig::deterministic().deterministic_seed.is_some();

        assert!(default_is_none && deterministic_is_some);
    }

    #[test]
    fn out_of_range_probabilities_are_clamped() {
        let config = FaultConfig::default()
            .with_write_failure_probability(3.0)
            .with_read_failure_probability(-1.0);

        assert_eq!(f32::from(config.write_failure_probability), 1.0);
        assert_eq!(f32::from(config.read_failure_probability), 0.0);
    }
}
