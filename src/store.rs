//! Quote Store - persistence and the draft → locked lifecycle
//!
//! All reads and writes of one quote id are serialized through a per-id
//! mutex, so `get`, `lock` and `refresh` never interleave on the same quote
//! and nobody observes a half-written record. Every read re-verifies the
//! stored signature.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::error::QuoteError;
use crate::fsio::write_json_atomic;
use crate::pipeline::QuotePipeline;
use crate::profile::SlicerProfile;
use crate::quote::{Quote, QuoteId, QuoteParams, QuoteStatus};
use crate::signing::is_well_formed;
use crate::uploads::{ModelRef, UploadDir};
use crate::ENGINE_VERSION;

const QUOTE_FILE: &str = "quote.json";
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// Durable storage for quotes. Implementations only move records; all
/// lifecycle rules live in `QuoteStore`.
#[async_trait]
pub trait QuoteRepository: Send + Sync {
    async fn load(&self, id: &QuoteId) -> Result<Option<Quote>, QuoteError>;
    async fn save(&self, quote: &Quote) -> Result<(), QuoteError>;
}

/// `<base>/<quoteId>/quote.json`, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileRepository {
    base: PathBuf,
}

impl FileRepository {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn quote_path(&self, id: &QuoteId) -> PathBuf {
        self.base.join(id.as_str()).join(QUOTE_FILE)
    }
}

#[async_trait]
impl QuoteRepository for FileRepository {
    async fn load(&self, id: &QuoteId) -> Result<Option<Quote>, QuoteError> {
        let bytes = match tokio::fs::read(self.quote_path(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(quote) => Ok(Some(quote)),
            Err(e) => {
                error!(quote_id = %id, error = %e, "stored quote is not valid JSON");
                Err(QuoteError::Integrity(id.to_string()))
            }
        }
    }

    async fn save(&self, quote: &Quote) -> Result<(), QuoteError> {
        let path = self.quote_path(&quote.quote_id);
        let quote = quote.clone();
        tokio::task::spawn_blocking(move || write_json_atomic(&path, &quote))
            .await
            .map_err(|e| QuoteError::Storage(std::io::Error::other(e)))??;
        Ok(())
    }
}

/// Keeps serialized records so what is read back is exactly what was written.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: Mutex<HashMap<QuoteId, String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&self, id: &QuoteId) -> Option<String> {
        self.records.lock().get(id).cloned()
    }

    pub fn put_raw(&self, id: &QuoteId, record: String) {
        self.records.lock().insert(id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QuoteRepository for MemoryRepository {
    async fn load(&self, id: &QuoteId) -> Result<Option<Quote>, QuoteError> {
        match self.raw(id) {
            None => Ok(None),
            Some(record) => serde_json::from_str(&record)
                .map(Some)
                .map_err(|_| QuoteError::Integrity(id.to_string())),
        }
    }

    async fn save(&self, quote: &Quote) -> Result<(), QuoteError> {
        let record = serde_json::to_string(quote)?;
        self.put_raw(&quote.quote_id, record);
        Ok(())
    }
}

/// One async mutex per quote id, created on demand.
#[derive(Default)]
struct IdLocks {
    table: Mutex<HashMap<QuoteId, Arc<AsyncMutex<()>>>>,
}

impl IdLocks {
    async fn acquire(&self, id: &QuoteId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock();
            if table.len() >= LOCK_TABLE_PRUNE_AT {
                // only the table holds these, nobody is waiting
                table.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(table.entry(id.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct QuoteStore {
    pipeline: Arc<QuotePipeline>,
    repo: Arc<dyn QuoteRepository>,
    uploads: UploadDir,
    locks: IdLocks,
}

impl QuoteStore {
    pub fn new(pipeline: Arc<QuotePipeline>, repo: Arc<dyn QuoteRepository>, uploads: UploadDir) -> Self {
        Self {
            pipeline,
            repo,
            uploads,
            locks: IdLocks::default(),
        }
    }

    pub fn pipeline(&self) -> &Arc<QuotePipeline> {
        &self.pipeline
    }

    pub fn resolve_model(&self, name: &str) -> Result<ModelRef, QuoteError> {
        let config = self.pipeline.config();
        self.uploads.resolve(name, &config.file_settings)
    }

    /// Slices, prices and signs, then persists a new draft. Nothing is
    /// written unless every step succeeded.
    pub async fn create(&self, model: &str, params: QuoteParams) -> Result<Quote, QuoteError> {
        let params = params.normalized();
        let model = self.resolve_model(model)?;
        let calc = self.pipeline.calculate(&model.path, &params).await?;

        let quote_id = QuoteId::generate();
        let signature = self.pipeline.signer().sign(&quote_id, &calc.params, &calc.computed)?;
        let quote = Quote {
            quote_id,
            params: calc.params,
            computed: calc.computed,
            status: QuoteStatus::Draft,
            signature,
            created_at: Utc::now(),
            model: model.name,
            profile_fingerprint: calc.profile_fingerprint,
            config_version: calc.config_version,
            core_version: ENGINE_VERSION.to_string(),
        };

        self.repo.save(&quote).await?;
        info!(
            quote_id = %quote.quote_id,
            total = quote.computed.pricing.total,
            currency = %quote.computed.pricing.currency,
            "quote created"
        );
        Ok(quote)
    }

    pub async fn get(&self, id: &str) -> Result<Quote, QuoteError> {
        let id = parse_id(id)?;
        let _guard = self.locks.acquire(&id).await;
        self.load_verified(&id).await
    }

    /// Freezes the price. The caller proves it holds the current record by
    /// presenting its signature. Locking a locked quote with the right
    /// signature returns it unchanged.
    pub async fn lock(&self, id: &str, signature: &str) -> Result<Quote, QuoteError> {
        let id = parse_id(id)?;
        let signature = signature.trim();
        if !is_well_formed(signature) {
            return Err(QuoteError::MalformedSignature);
        }

        let _guard = self.locks.acquire(&id).await;
        let mut quote = self.load_verified(&id).await?;

        if !self.pipeline.signer().verify(&quote, signature)? {
            warn!(quote_id = %id, status = quote.status.label(), "lock rejected: signature mismatch");
            return Err(QuoteError::SignatureMismatch);
        }

        if quote.status.is_locked() {
            return Ok(quote);
        }

        quote.status = QuoteStatus::Locked { locked_at: Utc::now() };
        self.repo.save(&quote).await?;
        info!(quote_id = %id, total = quote.computed.pricing.total, "quote locked");
        Ok(quote)
    }

    /// Re-prices a draft under the current configuration, re-slicing only
    /// when the slicer profile changed. Locked quotes never change.
    pub async fn refresh(&self, id: &str) -> Result<Quote, QuoteError> {
        let id = parse_id(id)?;
        let _guard = self.locks.acquire(&id).await;
        let quote = self.load_verified(&id).await?;

        if quote.status.is_locked() {
            warn!(quote_id = %id, "refresh rejected: quote is locked");
            return Err(QuoteError::Conflict(id.to_string()));
        }

        let config = self.pipeline.config();
        self.pipeline.check(&quote.params, &config)?;
        let fingerprint = SlicerProfile::resolve(&quote.params, &config)?.fingerprint()?;

        let metrics = if fingerprint == quote.profile_fingerprint {
            quote.computed.metrics.clone()
        } else {
            info!(quote_id = %id, "slicer profile changed, re-slicing");
            let model = self
                .uploads
                .resolve(&quote.model, &config.file_settings)?;
            self.pipeline.slice(&model.path, &quote.params, &config).await?.metrics
        };

        let computed = self.pipeline.price(metrics, &quote.params, &config)?;
        let signature = self.pipeline.signer().sign(&id, &quote.params, &computed)?;
        let refreshed = Quote {
            computed,
            signature,
            profile_fingerprint: fingerprint,
            config_version: config.version()?,
            ..quote
        };

        self.repo.save(&refreshed).await?;
        info!(quote_id = %id, total = refreshed.computed.pricing.total, "quote refreshed");
        Ok(refreshed)
    }

    async fn load_verified(&self, id: &QuoteId) -> Result<Quote, QuoteError> {
        let quote = self
            .repo
            .load(id)
            .await?
            .ok_or_else(|| QuoteError::NotFound(id.to_string()))?;

        if quote.quote_id != *id || !self.pipeline.signer().verify(&quote, &quote.signature)? {
            error!(quote_id = %id, "stored quote failed signature verification");
            return Err(QuoteError::Integrity(id.to_string()));
        }
        Ok(quote)
    }
}

fn parse_id(raw: &str) -> Result<QuoteId, QuoteError> {
    QuoteId::parse(raw).ok_or_else(|| QuoteError::NotFound(raw.to_string()))
}
