//! G-code Metrics Parser
//!
//! Reads filament usage and print time out of the slicer's report. Several
//! spellings per field are accepted, but a field that matches no known pattern
//! is an error: there is no default value.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

use crate::config::Material;

const SAMPLE_CHARS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintMetrics {
    pub filament_length_mm: f64,
    pub filament_weight_g: f64,
    pub print_time_s: u64,
    #[serde(default)]
    pub slicer_version: Option<String>,
}

impl PrintMetrics {
    pub fn print_time_hours(&self) -> f64 {
        self.print_time_s as f64 / 3600.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    FilamentLength,
    FilamentWeight,
    PrintTime,
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FilamentLength => "filament length",
            Self::FilamentWeight => "filament weight",
            Self::PrintTime => "print time",
        })
    }
}

#[derive(Debug, Error)]
#[error("Slicer report is missing {field}")]
pub struct ParseError {
    pub field: MetricField,
    /// Tail of the raw report, for diagnosis in logs.
    pub sample: String,
}

static LENGTH_MM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*;\s*filament[ _]used(?:\s*\[mm\]|_mm)\s*[=:]\s*([0-9.]+(?:\s*,\s*[0-9.]+)*)")
        .expect("valid length regex")
});
static LENGTH_M: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*;\s*filament used:\s*([0-9.]+)\s*m\b").expect("valid meters regex")
});
static TOTAL_WEIGHT_G: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*;\s*total filament used \[g\]\s*=\s*([0-9.]+)").expect("valid total weight regex")
});
static WEIGHT_G: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*;\s*filament[ _]used(?:\s*\[g\]|_g)\s*[=:]\s*([0-9.]+(?:\s*,\s*[0-9.]+)*)")
        .expect("valid weight regex")
});
static VOLUME_CM3: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*;\s*filament[ _]used(?:\s*\[cm3\]|_cm3)\s*[=:]\s*([0-9.]+(?:\s*,\s*[0-9.]+)*)")
        .expect("valid volume regex")
});
static TIME_TEXT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*;\s*estimated\s+printing\s+time[^=\n]*=\s*([^\n]+)").expect("valid time regex")
});
static TIME_SECONDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*;\s*TIME:\s*([0-9]+)").expect("valid seconds regex")
});
static DURATION_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+)\s*(d|h|min|m|s)\b").expect("valid duration regex")
});
static GENERATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)generated by\s+(?:PrusaSlicer|SuperSlicer|OrcaSlicer)[ -]v?(\d+\.\d+(?:\.\d+)?)")
        .expect("valid generator regex")
});

/// Derives weight from length using the material's filament geometry and density.
#[derive(Debug, Clone, Copy)]
pub struct GcodeMetricsParser {
    filament_diameter_mm: f64,
    density_g_cm3: f64,
}

impl GcodeMetricsParser {
    pub fn new(filament_diameter_mm: f64, density_g_cm3: f64) -> Self {
        Self { filament_diameter_mm, density_g_cm3 }
    }

    pub fn for_material(material: &Material) -> Self {
        Self::new(material.filament_diameter_mm, material.density_g_cm3)
    }

    pub fn parse(&self, report: &str) -> Result<PrintMetrics, ParseError> {
        let volume_cm3 = capture_sum(&VOLUME_CM3, report);

        let length_mm = capture_sum(&LENGTH_MM, report)
            .or_else(|| capture_sum(&LENGTH_M, report).map(|m| m * 1000.0))
            .or_else(|| volume_cm3.map(|v| v * 1000.0 / self.filament_area_mm2()))
            .filter(|v| *v > 0.0)
            .ok_or_else(|| missing(MetricField::FilamentLength, report))?;

        let weight_g = capture_sum(&TOTAL_WEIGHT_G, report)
            .or_else(|| capture_sum(&WEIGHT_G, report))
            .filter(|v| *v > 0.0)
            .or_else(|| volume_cm3.map(|v| v * self.density_g_cm3))
            .or_else(|| Some(self.weight_from_length(length_mm)))
            .filter(|v| v.is_finite() && *v > 0.0)
            .ok_or_else(|| missing(MetricField::FilamentWeight, report))?;

        let print_time_s = parse_print_time(report)
            .filter(|s| *s > 0)
            .ok_or_else(|| missing(MetricField::PrintTime, report))?;

        Ok(PrintMetrics {
            filament_length_mm: round2(length_mm),
            filament_weight_g: round2(weight_g),
            print_time_s,
            slicer_version: slicer_version(report),
        })
    }

    fn filament_area_mm2(&self) -> f64 {
        let r = self.filament_diameter_mm / 2.0;
        PI * r * r
    }

    pub fn weight_from_length(&self, length_mm: f64) -> f64 {
        let volume_cm3 = self.filament_area_mm2() * length_mm / 1000.0;
        volume_cm3 * self.density_g_cm3
    }
}

/// Engine version announced in the report header, normalized to `X.Y.Z`.
pub fn slicer_version(report: &str) -> Option<String> {
    let raw = GENERATOR.captures(report)?.get(1)?.as_str();
    if raw.matches('.').count() == 1 {
        Some(format!("{raw}.0"))
    } else {
        Some(raw.to_string())
    }
}

fn capture_sum(pattern: &Regex, report: &str) -> Option<f64> {
    let list = pattern.captures(report)?.get(1)?.as_str();
    let mut total = 0.0;
    for part in list.split(',') {
        total += part.trim().parse::<f64>().ok()?;
    }
    total.is_finite().then_some(total)
}

fn parse_print_time(report: &str) -> Option<u64> {
    if let Some(text) = TIME_TEXT.captures(report).and_then(|c| c.get(1)) {
        if let Some(seconds) = parse_duration(text.as_str()) {
            return Some(seconds);
        }
    }
    TIME_SECONDS
        .captures(report)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parses `1d 2h 3m 4s`-style durations. `None` when no component is present.
pub fn parse_duration(text: &str) -> Option<u64> {
    let mut seconds = 0u64;
    let mut found = false;
    for cap in DURATION_PART.captures_iter(text) {
        let value: u64 = cap[1].parse().ok()?;
        let unit = match cap[2].to_ascii_lowercase().as_str() {
            "d" => 86_400,
            "h" => 3_600,
            "m" | "min" => 60,
            _ => 1,
        };
        seconds = seconds.checked_add(value.checked_mul(unit)?)?;
        found = true;
    }
    found.then_some(seconds)
}

fn missing(field: MetricField, report: &str) -> ParseError {
    ParseError { field, sample: report_sample(report) }
}

fn report_sample(report: &str) -> String {
    let start = report
        .char_indices()
        .rev()
        .nth(SAMPLE_CHARS.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    report[start..].to_string()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRUSA_REPORT: &str = "\
; generated by PrusaSlicer 2.7.1+linux-x64-GTK3 on 2026-01-01 at 10:00:00 UTC
G1 X10 Y10 E0.5
; filament used [mm] = 16800.42
; filament used [cm3] = 40.41
; filament used [g] = 50.11
; filament cost = 0.00
; total filament used [g] = 50.11
; estimated printing time (normal mode) = 1h 2m 3s
; estimated printing time (silent mode) = 1h 10m 0s
";

    fn pla() -> GcodeMetricsParser {
        GcodeMetricsParser::new(1.75, 1.24)
    }

    #[test]
    fn test_parse_prusa_report() {
        let m = pla().parse(PRUSA_REPORT).unwrap();
        assert_eq!(m.filament_length_mm, 16800.42);
        assert_eq!(m.filament_weight_g, 50.11);
        assert_eq!(m.print_time_s, 3723);
        assert_eq!(m.slicer_version.as_deref(), Some("2.7.1"));
    }

    #[test]
    fn test_weight_derived_from_length() {
        let report = "; filament used [mm] = 1000\n; estimated printing time = 30m\n";
        let m = pla().parse(report).unwrap();
        assert_eq!(m.filament_weight_g, 2.98);
        assert_eq!(m.print_time_s, 1800);
        assert_eq!(m.slicer_version, None);
    }

    #[test]
    fn test_weight_derived_from_volume() {
        let report = "; filament used [mm] = 800\n; filament used [cm3] = 10.0\n;TIME:90\n";
        let m = pla().parse(report).unwrap();
        assert_eq!(m.filament_weight_g, 12.4);
        assert_eq!(m.print_time_s, 90);
    }

    #[test]
    fn test_multi_extruder_lists_are_summed() {
        let report = "\
; filament used [mm] = 100.5, 200.5
; filament used [g] = 1.25, 2.5
; estimated printing time (normal mode) = 1d 0h 0m 1s
";
        let m = pla().parse(report).unwrap();
        assert_eq!(m.filament_length_mm, 301.0);
        assert_eq!(m.filament_weight_g, 3.75);
        assert_eq!(m.print_time_s, 86_401);
    }

    #[test]
    fn test_alternative_spellings() {
        let report = "\
;FLAVOR:Marlin
;TIME:5025
;Filament used: 2.5m
; filament_used_g = 7.5
";
        let m = pla().parse(report).unwrap();
        assert_eq!(m.filament_length_mm, 2500.0);
        assert_eq!(m.filament_weight_g, 7.5);
        assert_eq!(m.print_time_s, 5025);
    }

    #[test]
    fn test_missing_length_fails_closed() {
        let report = "; estimated printing time = 1h\n; filament used [g] = 4\n";
        let err = pla().parse(report).unwrap_err();
        assert_eq!(err.field, MetricField::FilamentLength);
        assert!(err.sample.contains("estimated printing time"));
    }

    #[test]
    fn test_missing_time_fails_closed() {
        let report = "; filament used [mm] = 1000\n; estimated printing time = soon\n";
        let err = pla().parse(report).unwrap_err();
        assert_eq!(err.field, MetricField::PrintTime);
    }

    #[test]
    fn test_zero_values_are_not_accepted() {
        let report = "; filament used [mm] = 0.00\n;TIME:60\n";
        assert_eq!(pla().parse(report).unwrap_err().field, MetricField::FilamentLength);

        let report = "; filament used [mm] = 10\n;TIME:0\n";
        assert_eq!(pla().parse(report).unwrap_err().field, MetricField::PrintTime);
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("1h 23m 45s"), Some(5025));
        assert_eq!(parse_duration("2d 1m"), Some(172_860));
        assert_eq!(parse_duration("45s"), Some(45));
        assert_eq!(parse_duration("1h 5min"), Some(3900));
        assert_eq!(parse_duration("unknown"), None);
    }

    #[test]
    fn test_sample_is_bounded_tail() {
        let report = format!("{}END", "x".repeat(5000));
        let err = pla().parse(&report).unwrap_err();
        assert_eq!(err.sample.chars().count(), SAMPLE_CHARS);
        assert!(err.sample.ends_with("END"));
    }

    #[test]
    fn test_two_part_version_is_normalized() {
        assert_eq!(
            slicer_version("; generated by SuperSlicer 2.5 on today").as_deref(),
            Some("2.5.0")
        );
    }
}
