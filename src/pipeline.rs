//! Quote Pipeline - Single Entry Point
//!
//! slice (through the job queue) → parse → price. Nothing here persists;
//! a failure at any step leaves no trace.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, ConfigStore};
use crate::error::QuoteError;
use crate::metrics::{GcodeMetricsParser, PrintMetrics};
use crate::pricing::calculate_price;
use crate::profile::SlicerProfile;
use crate::queue::SequentialJobQueue;
use crate::quote::{QuoteComputed, QuoteParams};
use crate::signing::QuoteSigner;
use crate::slicer::{SliceRequest, SlicingEngine};
use crate::validation::{ValidationViolation, Validator};

#[derive(Debug, Clone, PartialEq)]
pub struct SliceOutcome {
    pub metrics: PrintMetrics,
    pub profile_fingerprint: String,
}

/// A priced, unpersisted result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Calculation {
    pub params: QuoteParams,
    pub computed: QuoteComputed,
    pub profile_fingerprint: String,
    pub config_version: String,
    #[serde(default)]
    pub warnings: Vec<ValidationViolation>,
}

pub struct QuotePipeline {
    config: Arc<ConfigStore>,
    engine: Arc<dyn SlicingEngine>,
    queue: Arc<SequentialJobQueue>,
    signer: QuoteSigner,
    validator: Validator,
}

impl QuotePipeline {
    pub fn new(
        config: Arc<ConfigStore>,
        engine: Arc<dyn SlicingEngine>,
        queue: Arc<SequentialJobQueue>,
        signer: QuoteSigner,
    ) -> Self {
        Self {
            config,
            engine,
            queue,
            signer,
            validator: Validator::new(),
        }
    }

    pub fn config(&self) -> Arc<AppConfig> {
        self.config.snapshot()
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn queue(&self) -> &SequentialJobQueue {
        &self.queue
    }

    pub fn signer(&self) -> &QuoteSigner {
        &self.signer
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Unknown keys are configuration errors; everything else goes through the
    /// validator. Returns non-blocking warnings.
    pub fn check(
        &self,
        params: &QuoteParams,
        config: &AppConfig,
    ) -> Result<Vec<ValidationViolation>, QuoteError> {
        config.material(&params.material)?;
        config.printer(&params.printer)?;
        config.quality(&params.quality)?;

        let result = self.validator.validate(params, config);
        if !result.valid {
            return Err(QuoteError::InvalidParams(result.summary()));
        }
        Ok(result.violations)
    }

    /// Runs the slicing engine through the job queue and extracts metrics.
    pub async fn slice(
        &self,
        model: &Path,
        params: &QuoteParams,
        config: &AppConfig,
    ) -> Result<SliceOutcome, QuoteError> {
        self.check(params, config)?;
        let profile = SlicerProfile::resolve(params, config)?;
        let profile_fingerprint = profile.fingerprint()?;
        let material = config.material(&params.material)?;

        let request = SliceRequest {
            job_id: format!("job_{}", Uuid::new_v4().simple()),
            model: model.to_path_buf(),
            profile,
        };
        let job_id = request.job_id.clone();
        debug!(%job_id, engine = self.engine.name(), "queueing slicing job");

        let report = self
            .queue
            .run(&job_id, || self.engine.slice(&request))
            .await?;

        let metrics = GcodeMetricsParser::for_material(material)
            .parse(&report)
            .map_err(|e| {
                warn!(%job_id, field = %e.field, sample = %e.sample, "slicer report unreadable");
                e
            })?;
        check_engine_version(&metrics, config)?;

        info!(
            %job_id,
            weight_g = metrics.filament_weight_g,
            time_s = metrics.print_time_s,
            "model sliced"
        );
        Ok(SliceOutcome { metrics, profile_fingerprint })
    }

    /// Pure pricing step over already-known metrics.
    pub fn price(
        &self,
        metrics: PrintMetrics,
        params: &QuoteParams,
        config: &AppConfig,
    ) -> Result<QuoteComputed, QuoteError> {
        let material = config.material(&params.material)?;
        let printer = config.printer(&params.printer)?;
        let finishes = params
            .post_processing
            .iter()
            .map(|key| config.post_processing_option(key))
            .collect::<Result<Vec<_>, _>>()?;

        let pricing = calculate_price(
            &metrics,
            material,
            printer,
            &config.pricing,
            params.quantity,
            &finishes,
        )?;
        Ok(QuoteComputed { metrics, pricing })
    }

    /// Full slice → parse → price run without persisting.
    pub async fn calculate(&self, model: &Path, params: &QuoteParams) -> Result<Calculation, QuoteError> {
        let config = self.config();
        let warnings = self.check(params, &config)?;
        let outcome = self.slice(model, params, &config).await?;
        let computed = self.price(outcome.metrics, params, &config)?;
        Ok(Calculation {
            params: params.clone(),
            computed,
            profile_fingerprint: outcome.profile_fingerprint,
            config_version: config.version()?,
            warnings,
        })
    }

    /// Prices client-supplied metrics; no engine involved.
    pub fn calculate_from_metrics(
        &self,
        metrics: PrintMetrics,
        params: &QuoteParams,
    ) -> Result<Calculation, QuoteError> {
        let config = self.config();
        let warnings = self.check(params, &config)?;
        if !(metrics.filament_weight_g >= 0.0 && metrics.filament_weight_g.is_finite()) {
            return Err(QuoteError::InvalidParams("filament weight must be non-negative".into()));
        }
        let profile_fingerprint = SlicerProfile::resolve(params, &config)?.fingerprint()?;
        let computed = self.price(metrics, params, &config)?;
        Ok(Calculation {
            params: params.clone(),
            computed,
            profile_fingerprint,
            config_version: config.version()?,
            warnings,
        })
    }
}

fn check_engine_version(metrics: &PrintMetrics, config: &AppConfig) -> Result<(), QuoteError> {
    let (Some(min), Some(found)) = (&config.slicer.min_version, &metrics.slicer_version) else {
        return Ok(());
    };
    let (Ok(min_ver), Ok(found_ver)) = (semver::Version::parse(min), semver::Version::parse(found)) else {
        return Ok(());
    };
    if found_ver < min_ver {
        return Err(QuoteError::slicing(
            "unsupported slicing engine version",
            format!("engine {found} is older than required {min}"),
        ));
    }
    Ok(())
}
