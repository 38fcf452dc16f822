//! Slicer Profile
//!
//! Resolved from quote parameters plus configuration: layer height from the
//! quality preset, temperatures and speeds from the material, bed and nozzle
//! from the printer.

use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::QuoteError;
use crate::hashing::{fingerprint, format_float};
use crate::quote::QuoteParams;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlicerProfile {
    pub layer_height_mm: f64,
    pub infill_percent: u8,
    pub supports: bool,
    pub bed_temp_c: u32,
    pub extruder_temp_c: u32,
    pub perimeter_speed: u32,
    pub infill_speed: u32,
    pub solid_infill_speed: u32,
    pub nozzle_diameter_mm: f64,
    pub filament_diameter_mm: f64,
    /// Feeds the reported filament weight, so it is part of the fingerprint.
    pub filament_density_g_cm3: f64,
    pub bed_size_mm: [f64; 3],
}

impl SlicerProfile {
    pub fn resolve(params: &QuoteParams, config: &AppConfig) -> Result<Self, QuoteError> {
        let material = config.material(&params.material)?;
        let printer = config.printer(&params.printer)?;
        let quality = config.quality(&params.quality)?;

        Ok(Self {
            layer_height_mm: quality.layer_height,
            infill_percent: params.infill_percent,
            supports: params.supports,
            bed_temp_c: material.bed_temp,
            extruder_temp_c: material.extruder_temp,
            perimeter_speed: material.perimeter_speed,
            infill_speed: material.infill_speed,
            solid_infill_speed: material.solid_infill_speed,
            nozzle_diameter_mm: printer.nozzle_diameter_mm,
            filament_diameter_mm: material.filament_diameter_mm,
            filament_density_g_cm3: material.density_g_cm3,
            bed_size_mm: printer.bed_size_mm,
        })
    }

    /// Changes whenever anything that affects slicing output changes.
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        fingerprint(self)
    }

    /// PrusaSlicer command-line options for this profile.
    pub fn to_args(&self) -> Vec<String> {
        let [x, y, z] = self.bed_size_mm;
        let mut args = vec![
            "--layer-height".to_string(),
            format_float(self.layer_height_mm),
            "--fill-density".to_string(),
            format!("{}%", self.infill_percent),
            "--bed-temperature".to_string(),
            self.bed_temp_c.to_string(),
            "--temperature".to_string(),
            self.extruder_temp_c.to_string(),
            "--perimeter-speed".to_string(),
            self.perimeter_speed.to_string(),
            "--infill-speed".to_string(),
            self.infill_speed.to_string(),
            "--solid-infill-speed".to_string(),
            self.solid_infill_speed.to_string(),
            "--nozzle-diameter".to_string(),
            format_float(self.nozzle_diameter_mm),
            "--filament-diameter".to_string(),
            format_float(self.filament_diameter_mm),
            "--filament-density".to_string(),
            format_float(self.filament_density_g_cm3),
            "--bed-shape".to_string(),
            format!("0x0,{}x0,{}x{},0x{}", format_float(x), format_float(x), format_float(y), format_float(y)),
            "--max-print-height".to_string(),
            format_float(z),
        ];
        if self.supports {
            args.push("--support-material".to_string());
        }
        args
    }
}
