//! Contract Invariant Tests
//!
//! These tests verify the non-negotiable guarantees.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use printquote_core::slicer::SliceRequest;
use printquote_core::uploads::UploadDir;
use printquote_core::{
    canonical_json, AppConfig, ConfigStore, FileRepository, FixtureEngine, QuoteError,
    QuoteParams, QuotePipeline, QuoteSigner, QuoteStatus, QuoteStore, SequentialJobQueue,
    SigningKey, SlicingEngine,
};

const REPORT: &str = "\
; generated by PrusaSlicer 2.7.1+linux-x64 on 2026-03-01 at 10:00:00 UTC
; filament used [mm] = 16800.42
; filament used [cm3] = 40.32
; filament used [g] = 50.00
; estimated printing time (normal mode) = 1h 0m 0s
";

/// Wraps the fixture engine, counting calls and the peak number running at once.
struct CountingEngine {
    inner: FixtureEngine,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingEngine {
    fn new(delay: Duration) -> Self {
        Self {
            inner: FixtureEngine::new(REPORT),
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SlicingEngine for CountingEngine {
    fn name(&self) -> &str {
        "counting-fixture"
    }

    async fn slice(&self, request: &SliceRequest) -> Result<String, QuoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.slice(request).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

struct Harness {
    _uploads: tempfile::TempDir,
    quotes: tempfile::TempDir,
    engine: Arc<CountingEngine>,
    repo: FileRepository,
    store: Arc<QuoteStore>,
}

fn reference_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.printers.get_mut("prusa_mk3s").unwrap().markup_multiplier = 1.0;
    config
}

fn harness_with(config: AppConfig, delay: Duration, job_timeout: Duration) -> Harness {
    let uploads = tempfile::tempdir().unwrap();
    let quotes = tempfile::tempdir().unwrap();
    std::fs::write(uploads.path().join("bracket.stl"), "solid bracket\nendsolid bracket\n").unwrap();

    let engine = Arc::new(CountingEngine::new(delay));
    let pipeline = Arc::new(QuotePipeline::new(
        Arc::new(ConfigStore::in_memory(config).unwrap()),
        engine.clone(),
        Arc::new(SequentialJobQueue::new(Duration::from_secs(30), job_timeout)),
        QuoteSigner::new(SigningKey::new("invariant-test-secret-key").unwrap()),
    ));
    let repo = FileRepository::new(quotes.path());
    let store = Arc::new(QuoteStore::new(
        pipeline,
        Arc::new(repo.clone()),
        UploadDir::new(uploads.path()),
    ));
    Harness { _uploads: uploads, quotes, engine, repo, store }
}

fn harness() -> Harness {
    harness_with(reference_config(), Duration::ZERO, Duration::from_secs(30))
}

fn params() -> QuoteParams {
    QuoteParams {
        material: "pla".into(),
        quality: "standard".into(),
        printer: "prusa_mk3s".into(),
        quantity: 1,
        infill_percent: 20,
        supports: false,
        post_processing: vec![],
    }
}

fn stored_quote_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

#[tokio::test]
async fn invariant_reference_computation() {
    let h = harness();
    let quote = h.store.create("bracket.stl", params()).await.unwrap();
    let pricing = &quote.computed.pricing;

    assert_eq!(pricing.base_cost, 150.0);
    assert_eq!(pricing.material_cost, 40.0);
    assert_eq!(pricing.electricity_cost, 7.0);
    assert_eq!(pricing.depreciation_cost, 50.0);
    assert_eq!(pricing.subtotal, 247.0);
    assert_eq!(pricing.markup, 0.0);
    assert_eq!(pricing.tax, 44.46);
    assert_eq!(pricing.total, 291.46);
    assert_eq!(quote.computed.metrics.slicer_version.as_deref(), Some("2.7.1"));
}

#[tokio::test]
async fn invariant_create_then_get_is_identical() {
    let h = harness();
    let created = h.store.create("bracket.stl", params()).await.unwrap();
    assert_eq!(created.status, QuoteStatus::Draft);

    let fetched = h.store.get(created.quote_id.as_str()).await.unwrap();
    assert_eq!(fetched.params, created.params);
    assert_eq!(fetched.computed, created.computed);
    assert_eq!(fetched.signature, created.signature);
    assert!(h.repo.quote_path(&created.quote_id).is_file());
}

#[tokio::test]
async fn invariant_altered_signature_never_locks() {
    let h = harness();
    let quote = h.store.create("bracket.stl", params()).await.unwrap();
    let id = quote.quote_id.as_str();

    for position in [0, 31, 63] {
        let mut altered = quote.signature.clone();
        let original = &quote.signature[position..=position];
        altered.replace_range(position..=position, if original == "f" { "0" } else { "f" });

        let err = h.store.lock(id, &altered).await.unwrap_err();
        assert!(matches!(err, QuoteError::SignatureMismatch), "position {position}");
        assert_eq!(h.store.get(id).await.unwrap().status, QuoteStatus::Draft);
    }

    // hex is compared as text, so a case change is an alteration too
    if let Some(position) = quote.signature.find(|c: char| matches!(c, 'a'..='f')) {
        let mut upper = quote.signature.clone();
        upper[position..=position].make_ascii_uppercase();
        let err = h.store.lock(id, &upper).await.unwrap_err();
        assert!(matches!(err, QuoteError::SignatureMismatch));
        assert_eq!(h.store.get(id).await.unwrap().status, QuoteStatus::Draft);
    }
    let err = h.store.lock(id, &quote.signature.to_ascii_uppercase()).await.unwrap_err();
    assert!(matches!(err, QuoteError::SignatureMismatch));

    let locked = h.store.lock(id, &quote.signature).await.unwrap();
    assert!(locked.status.is_locked());
}

#[tokio::test]
async fn invariant_locked_quote_is_immutable() {
    let h = harness();
    let quote = h.store.create("bracket.stl", params()).await.unwrap();
    let id = quote.quote_id.as_str();
    h.store.lock(id, &quote.signature).await.unwrap();

    let path = h.repo.quote_path(&quote.quote_id);
    let before = std::fs::read(&path).unwrap();

    let err = h.store.refresh(id).await.unwrap_err();
    assert!(matches!(err, QuoteError::Conflict(_)));
    assert_eq!(std::fs::read(&path).unwrap(), before);

    // a repeated lock is idempotent and writes nothing
    h.store.lock(id, &quote.signature).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn invariant_slicing_is_sequential() {
    let h = harness_with(reference_config(), Duration::from_millis(20), Duration::from_secs(30));

    let creates = (0..6).map(|_| {
        let store = h.store.clone();
        tokio::spawn(async move { store.create("bracket.stl", params()).await })
    });
    let mut ids = vec![];
    for handle in creates.collect::<Vec<_>>() {
        ids.push(handle.await.unwrap().unwrap().quote_id);
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 6);
    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 6);
    assert_eq!(h.engine.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invariant_lock_and_refresh_never_interleave() {
    let h = harness();
    let mut drafts = vec![];
    for _ in 0..8 {
        drafts.push(h.store.create("bracket.stl", params()).await.unwrap());
    }

    let config_store = h.store.pipeline().config_store();
    let mut config = (*config_store.snapshot()).clone();
    config.materials.get_mut("pla").unwrap().price_per_kg = 1600.0;
    config_store.replace(config).unwrap();

    for draft in drafts {
        let id = draft.quote_id.to_string();
        let lock = {
            let (store, id, signature) = (h.store.clone(), id.clone(), draft.signature.clone());
            tokio::spawn(async move { store.lock(&id, &signature).await })
        };
        let refresh = {
            let (store, id) = (h.store.clone(), id.clone());
            tokio::spawn(async move { store.refresh(&id).await })
        };
        let (locked, refreshed) = (lock.await.unwrap(), refresh.await.unwrap());
        let stored = h.store.get(&id).await.unwrap();

        match (locked, refreshed) {
            (Ok(_), Err(QuoteError::Conflict(_))) => {
                assert!(stored.status.is_locked());
                assert_eq!(stored.computed, draft.computed);
                assert_eq!(stored.signature, draft.signature);
            }
            (Err(QuoteError::SignatureMismatch), Ok(refreshed)) => {
                assert_eq!(stored.status, QuoteStatus::Draft);
                assert_eq!(stored.computed, refreshed.computed);
                assert_eq!(stored.computed.pricing.material_cost, 80.0);
            }
            (locked, refreshed) => panic!("interleaved outcome: {locked:?} / {refreshed:?}"),
        }
    }
}

#[tokio::test]
async fn invariant_queue_timeout_persists_nothing() {
    let h = harness_with(reference_config(), Duration::from_millis(500), Duration::from_millis(50));
    let err = h.store.create("bracket.stl", params()).await.unwrap_err();
    assert!(matches!(err, QuoteError::Timeout(_)));
    assert_eq!(stored_quote_files(h.quotes.path()), 0);
    assert_eq!(h.store.pipeline().queue().stats().timed_out, 1);
}

#[tokio::test]
async fn invariant_failed_slice_persists_nothing() {
    let h = harness();
    let err = h.store.create("missing.stl", params()).await.unwrap_err();
    assert!(matches!(err, QuoteError::Slicing { .. }));
    assert_eq!(stored_quote_files(h.quotes.path()), 0);
}

#[tokio::test]
async fn invariant_unknown_key_never_reaches_engine() {
    let h = harness();
    let mut p = params();
    p.printer = "replicator".into();
    let err = h.store.create("bracket.stl", p).await.unwrap_err();
    assert!(matches!(err, QuoteError::Config(_)));
    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stored_quote_files(h.quotes.path()), 0);
}

#[tokio::test]
async fn invariant_settings_change_leaves_locked_quotes_alone() {
    let h = harness();
    let locked = h.store.create("bracket.stl", params()).await.unwrap();
    h.store.lock(locked.quote_id.as_str(), &locked.signature).await.unwrap();
    let draft = h.store.create("bracket.stl", params()).await.unwrap();

    let config_store = h.store.pipeline().config_store();
    let mut config = (*config_store.snapshot()).clone();
    config.materials.get_mut("pla").unwrap().price_per_kg = 1600.0;
    config_store.replace(config).unwrap();

    let refreshed = h.store.refresh(draft.quote_id.as_str()).await.unwrap();
    assert_eq!(refreshed.computed.pricing.material_cost, 80.0);

    let still = h.store.get(locked.quote_id.as_str()).await.unwrap();
    assert_eq!(still.computed, locked.computed);
    // metrics were reused, so only the two creates sliced
    assert_eq!(h.engine.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn invariant_canonical_json_deterministic() {
    let a = serde_json::json!({ "b": 1, "a": [2.50, { "z": true, "y": null }] });
    let b = serde_json::json!({ "a": [2.5, { "y": null, "z": true }], "b": 1.0 });
    assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    assert_eq!(canonical_json(&a).unwrap(), r#"{"a":[2.5,{"y":null,"z":true}],"b":1}"#);
}
