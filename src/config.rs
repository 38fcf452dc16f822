//! Configuration - Materials, Printers, Pricing
//!
//! Loaded once at startup and validated before the server accepts requests.
//! Components receive `Arc<AppConfig>` snapshots; nothing reads ambient globals.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::fsio::write_json_atomic;
use crate::hashing::fingerprint;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unknown {kind}: {key}")]
    UnknownKey { kind: &'static str, key: String },

    #[error("Slicing engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Signing secret: {0}")]
    Secret(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub application: ApplicationInfo,
    pub slicer: SlicerSettings,
    pub materials: BTreeMap<String, Material>,
    pub print_quality: BTreeMap<String, QualityPreset>,
    #[serde(default)]
    pub infill_options: InfillOptions,
    pub pricing: PricingConfig,
    pub printers: BTreeMap<String, Printer>,
    #[serde(default)]
    pub post_processing: BTreeMap<String, PostProcessingOption>,
    #[serde(default)]
    pub file_settings: FileSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self {
            name: "Machine Shop Suite".to_string(),
            version: crate::ENGINE_VERSION.to_string(),
            description: "3D Printing Quote Engine".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlicerSettings {
    pub path: String,
    #[serde(default = "default_slice_timeout")]
    pub timeout_seconds: u64,
    /// How long a request may wait for the slicing slot.
    #[serde(default = "default_queue_wait")]
    pub queue_wait_seconds: u64,
    /// Reports from older engine versions are rejected.
    #[serde(default)]
    pub min_version: Option<String>,
}

impl SlicerSettings {
    /// Fields that only take effect when the engine and queue are rebuilt,
    /// i.e. on restart. `min_version` is read per job and may change live.
    pub fn restart_only_changes(&self, next: &Self) -> Vec<&'static str> {
        let mut changed = vec![];
        if self.path != next.path {
            changed.push("slicer.path");
        }
        if self.timeout_seconds != next.timeout_seconds {
            changed.push("slicer.timeout_seconds");
        }
        if self.queue_wait_seconds != next.queue_wait_seconds {
            changed.push("slicer.queue_wait_seconds");
        }
        changed
    }
}

fn default_slice_timeout() -> u64 { 300 }
fn default_queue_wait() -> u64 { 600 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub density_g_cm3: f64,
    pub price_per_kg: f64,
    pub bed_temp: u32,
    pub extruder_temp: u32,
    pub perimeter_speed: u32,
    pub infill_speed: u32,
    pub solid_infill_speed: u32,
    #[serde(default = "default_filament_diameter")]
    pub filament_diameter_mm: f64,
    #[serde(default)]
    pub colors: Vec<String>,
}

fn default_filament_diameter() -> f64 { 1.75 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub name: String,
    pub layer_height: f64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfillOptions {
    pub min_percentage: u8,
    pub max_percentage: u8,
    pub default_percentage: u8,
    #[serde(default)]
    pub recommended: BTreeMap<String, u8>,
}

impl Default for InfillOptions {
    fn default() -> Self {
        Self {
            min_percentage: 5,
            max_percentage: 100,
            default_percentage: 20,
            recommended: BTreeMap::from([
                ("prototype".to_string(), 10),
                ("standard".to_string(), 20),
                ("functional".to_string(), 40),
                ("structural".to_string(), 80),
                ("solid".to_string(), 100),
            ]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingConfig {
    pub base_cost: f64,
    pub electricity_rate_per_kwh: f64,
    pub printer_power_watts: f64,
    pub depreciation_per_hour: f64,
    /// Flat per-unit handling cost (consumables, labour).
    #[serde(default)]
    pub other_costs_per_print: f64,
    #[serde(alias = "gst_rate")]
    pub tax_rate: f64,
    pub currency: String,
    pub currency_symbol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Printer {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub bed_size_mm: [f64; 3],
    pub nozzle_diameter_mm: f64,
    #[serde(default)]
    pub max_print_speed_mm_s: Option<u32>,
    pub markup_multiplier: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool { true }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessingOption {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSettings {
    pub max_file_size_mb: u64,
    pub allowed_extensions: Vec<String>,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            max_file_size_mb: 100,
            allowed_extensions: vec!["stl".to_string()],
        }
    }
}

impl AppConfig {
    pub fn material(&self, key: &str) -> Result<&Material, ConfigError> {
        self.materials.get(key).ok_or_else(|| unknown("material", key))
    }

    pub fn printer(&self, key: &str) -> Result<&Printer, ConfigError> {
        self.printers.get(key).ok_or_else(|| unknown("printer", key))
    }

    pub fn quality(&self, key: &str) -> Result<&QualityPreset, ConfigError> {
        self.print_quality.get(key).ok_or_else(|| unknown("quality", key))
    }

    pub fn post_processing_option(&self, key: &str) -> Result<&PostProcessingOption, ConfigError> {
        self.post_processing
            .get(key)
            .ok_or_else(|| unknown("post-processing option", key))
    }

    pub fn enabled_printers(&self) -> BTreeMap<&str, &Printer> {
        self.printers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(k, p)| (k.as_str(), p))
            .collect()
    }

    pub fn enabled_post_processing(&self) -> BTreeMap<&str, &PostProcessingOption> {
        self.post_processing
            .iter()
            .filter(|(_, o)| o.enabled)
            .map(|(k, o)| (k.as_str(), o))
            .collect()
    }

    /// Stable short hash of the whole configuration.
    pub fn version(&self) -> Result<String, serde_json::Error> {
        let mut hash = fingerprint(self)?;
        hash.truncate(16);
        Ok(hash)
    }

    /// Fail-fast structural checks. Collects every problem before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = vec![];

        if self.slicer.path.trim().is_empty() {
            problems.push("slicer.path is empty".to_string());
        }
        if self.slicer.timeout_seconds == 0 {
            problems.push("slicer.timeout_seconds must be positive".to_string());
        }
        if let Some(min) = &self.slicer.min_version {
            if semver::Version::parse(min).is_err() {
                problems.push(format!("slicer.min_version '{min}' is not a semantic version"));
            }
        }
        if self.materials.is_empty() {
            problems.push("no materials configured".to_string());
        }
        for (key, m) in &self.materials {
            if !(m.density_g_cm3 > 0.0) {
                problems.push(format!("material '{key}': density must be positive"));
            }
            if !(m.price_per_kg >= 0.0) {
                problems.push(format!("material '{key}': price_per_kg must be non-negative"));
            }
            if !(m.filament_diameter_mm > 0.0) {
                problems.push(format!("material '{key}': filament_diameter_mm must be positive"));
            }
        }
        if self.print_quality.is_empty() {
            problems.push("no print qualities configured".to_string());
        }
        for (key, q) in &self.print_quality {
            if !(q.layer_height > 0.0) {
                problems.push(format!("quality '{key}': layer_height must be positive"));
            }
        }
        if self.printers.is_empty() {
            problems.push("no printers configured".to_string());
        }
        for (key, p) in &self.printers {
            if !(p.markup_multiplier >= 1.0) {
                problems.push(format!("printer '{key}': markup_multiplier must be >= 1"));
            }
            if !(p.nozzle_diameter_mm > 0.0) {
                problems.push(format!("printer '{key}': nozzle_diameter_mm must be positive"));
            }
        }
        for (key, o) in &self.post_processing {
            if !(o.price >= 0.0) {
                problems.push(format!("post-processing '{key}': price must be non-negative"));
            }
        }

        let p = &self.pricing;
        for (name, value) in [
            ("base_cost", p.base_cost),
            ("electricity_rate_per_kwh", p.electricity_rate_per_kwh),
            ("printer_power_watts", p.printer_power_watts),
            ("depreciation_per_hour", p.depreciation_per_hour),
            ("other_costs_per_print", p.other_costs_per_print),
        ] {
            if !(value >= 0.0) {
                problems.push(format!("pricing.{name} must be non-negative"));
            }
        }
        if !(0.0..=1.0).contains(&p.tax_rate) {
            problems.push("pricing.tax_rate must be within 0..=1".to_string());
        }

        let infill = &self.infill_options;
        if infill.min_percentage > infill.max_percentage || infill.max_percentage > 100 {
            problems.push("infill_options range is invalid".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

fn unknown(kind: &'static str, key: &str) -> ConfigError {
    ConfigError::UnknownKey {
        kind,
        key: key.to_string(),
    }
}

/// Holds the live configuration. Readers take cheap `Arc` snapshots so a
/// settings update never changes a computation already in flight.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<AppConfig>>,
}

impl ConfigStore {
    pub fn in_memory(config: AppConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Load from `path`, writing the defaults there first if it does not exist.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<AppConfig>(&content)?
        } else {
            warn!(path = %path.display(), "configuration file missing, writing defaults");
            let config = AppConfig::default();
            write_json_atomic(path, &config)?;
            config
        };
        config.validate()?;
        info!(
            path = %path.display(),
            materials = config.materials.len(),
            printers = config.printers.len(),
            "configuration loaded"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub fn snapshot(&self) -> Arc<AppConfig> {
        Arc::clone(&self.current.read())
    }

    /// Validate and install new settings, persisting them when file-backed.
    pub fn replace(&self, config: AppConfig) -> Result<Arc<AppConfig>, ConfigError> {
        config.validate()?;
        if let Some(path) = &self.path {
            write_json_atomic(path, &config)?;
        }
        let config = Arc::new(config);
        *self.current.write() = Arc::clone(&config);
        info!("settings updated");
        Ok(config)
    }
}

fn material(
    name: &str,
    description: &str,
    density: f64,
    price_per_kg: f64,
    temps: (u32, u32),
    speeds: (u32, u32, u32),
    colors: &[&str],
) -> Material {
    Material {
        name: name.to_string(),
        description: description.to_string(),
        density_g_cm3: density,
        price_per_kg,
        bed_temp: temps.0,
        extruder_temp: temps.1,
        perimeter_speed: speeds.0,
        infill_speed: speeds.1,
        solid_infill_speed: speeds.2,
        filament_diameter_mm: default_filament_diameter(),
        colors: colors.iter().map(|c| c.to_string()).collect(),
    }
}

fn quality(name: &str, layer_height: f64, description: &str) -> QualityPreset {
    QualityPreset {
        name: name.to_string(),
        layer_height,
        description: description.to_string(),
    }
}

fn printer(name: &str, description: &str, bed: [f64; 3], max_speed: u32, markup: f64) -> Printer {
    Printer {
        name: name.to_string(),
        description: description.to_string(),
        bed_size_mm: bed,
        nozzle_diameter_mm: 0.4,
        max_print_speed_mm_s: Some(max_speed),
        markup_multiplier: markup,
        enabled: true,
    }
}

fn finish(name: &str, description: &str, price: f64) -> PostProcessingOption {
    PostProcessingOption {
        name: name.to_string(),
        description: description.to_string(),
        price,
        enabled: true,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let materials = BTreeMap::from([
            ("pla".to_string(), material(
                "PLA (Polylactic Acid)",
                "Easy to print, biodegradable, good for prototypes",
                1.24, 800.0, (55, 215), (100, 180, 160),
                &["White", "Black", "Red", "Blue", "Green", "Yellow", "Orange", "Gray"],
            )),
            ("abs".to_string(), material(
                "ABS (Acrylonitrile Butadiene Styrene)",
                "Strong and durable, heat resistant, good for functional parts",
                1.04, 1000.0, (90, 245), (80, 160, 140),
                &["White", "Black", "Red", "Blue", "Natural"],
            )),
            ("petg".to_string(), material(
                "PETG (Polyethylene Terephthalate Glycol)",
                "Strong, flexible, chemical resistant, food-safe option",
                1.27, 1000.0, (70, 240), (70, 150, 120),
                &["Clear", "White", "Black", "Blue", "Red"],
            )),
            ("tpu".to_string(), material(
                "TPU (Thermoplastic Polyurethane)",
                "Flexible and elastic, excellent for grips and cushioning",
                1.21, 1500.0, (60, 230), (30, 40, 35),
                &["Black", "White", "Red", "Blue", "Clear"],
            )),
            ("nylon".to_string(), material(
                "Nylon (Polyamide)",
                "Very strong and durable, excellent layer adhesion",
                1.14, 1800.0, (80, 250), (60, 100, 80),
                &["Natural", "Black", "White"],
            )),
        ]);

        let print_quality = BTreeMap::from([
            ("draft".to_string(), quality("Draft (Fast)", 0.3, "Fastest print, visible layers")),
            ("standard".to_string(), quality("Standard (Balanced)", 0.2, "Good balance of speed and quality")),
            ("fine".to_string(), quality("Fine (Detailed)", 0.15, "Higher detail, longer print time")),
            ("ultra_fine".to_string(), quality("Ultra Fine (Maximum Detail)", 0.1, "Best quality, slowest print")),
        ]);

        let printers = BTreeMap::from([
            ("prusa_mk3s".to_string(), printer(
                "Prusa i3 MK3S+", "Original Prusa i3 MK3S+ FDM printer",
                [250.0, 210.0, 210.0], 200, 1.3,
            )),
            ("ender3_v2".to_string(), printer(
                "Creality Ender 3 V2", "Creality Ender 3 V2 budget FDM printer",
                [220.0, 220.0, 250.0], 180, 1.25,
            )),
            ("bambu_x1".to_string(), printer(
                "Bambu Lab X1 Carbon", "Bambu Lab X1 Carbon high-speed printer",
                [256.0, 256.0, 256.0], 500, 1.4,
            )),
        ]);

        let post_processing = BTreeMap::from([
            ("sanding".to_string(), finish("Sanding & Smoothing", "Manual sanding for smooth surface finish", 500.0)),
            ("painting".to_string(), finish("Painting", "Spray painting with primer and topcoat", 1500.0)),
            ("polishing".to_string(), finish("Polishing", "High-gloss polishing for aesthetic finish", 800.0)),
            ("threading".to_string(), finish("Threading/Tapping", "Adding threads to holes for screws/bolts", 300.0)),
        ]);

        Self {
            application: ApplicationInfo::default(),
            slicer: SlicerSettings {
                path: "prusa-slicer".to_string(),
                timeout_seconds: default_slice_timeout(),
                queue_wait_seconds: default_queue_wait(),
                min_version: None,
            },
            materials,
            print_quality,
            infill_options: InfillOptions::default(),
            pricing: PricingConfig {
                base_cost: 150.0,
                electricity_rate_per_kwh: 7.0,
                printer_power_watts: 1000.0,
                depreciation_per_hour: 50.0,
                other_costs_per_print: 0.0,
                tax_rate: 0.18,
                currency: "INR".to_string(),
                currency_symbol: "₹".to_string(),
            },
            printers,
            post_processing,
            file_settings: FileSettings::default(),
        }
    }
}
