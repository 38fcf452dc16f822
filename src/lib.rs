//! PrintQuote Core - 3D Print Quote Engine
//!
//! # Guarantees
//! 1. A quote exists only after slicing, parsing and pricing all succeeded
//! 2. Every stored quote is signed; every read re-verifies the signature
//! 3. Locked quotes never change
//! 4. One slicing job runs at a time, admitted in arrival order
//! 5. Pricing is a pure function of metrics and configuration

pub mod config;
pub mod error;
pub mod fsio;
pub mod hashing;
pub mod metrics;
pub mod pipeline;
pub mod pricing;
pub mod profile;
pub mod queue;
pub mod quote;
pub mod server;
pub mod signing;
pub mod slicer;
pub mod store;
pub mod uploads;
pub mod validation;

pub use config::{AppConfig, ConfigError, ConfigStore};
pub use error::QuoteError;
pub use hashing::{canonical_json, fingerprint, sha256_hex};
pub use metrics::{GcodeMetricsParser, ParseError, PrintMetrics};
pub use pipeline::{Calculation, QuotePipeline};
pub use pricing::{calculate_price, PriceBreakdown};
pub use queue::SequentialJobQueue;
pub use quote::{Quote, QuoteComputed, QuoteId, QuoteParams, QuoteStatus};
pub use signing::{QuoteSigner, SigningKey};
pub use slicer::{FixtureEngine, PrusaSlicerEngine, SlicingEngine};
pub use store::{FileRepository, MemoryRepository, QuoteRepository, QuoteStore};
pub use validation::{ValidationResult, ValidationRule, ValidationViolation, ViolationSeverity};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
