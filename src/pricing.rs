//! Pricing Calculator
//!
//! Pure: identical inputs always give an identical breakdown.
//!
//! Quantity policy: copies are printed independently, so every line item
//! (base, material, electricity, depreciation, other costs, post-processing) scales
//! linearly with quantity.
//!
//! Rounding: each line item is rounded half away from zero to 2 decimals
//! in decimal arithmetic.
//! Subtotal, markup, tax and total are built from the rounded items, so the
//! published breakdown always adds up exactly.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use crate::config::{Material, PostProcessingOption, PricingConfig, Printer};
use crate::metrics::PrintMetrics;

const MONEY_DP: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("{0} is not a finite number")]
    NotFinite(&'static str),

    #[error("{0} is outside the priceable range")]
    OutOfRange(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBreakdown {
    pub quantity: u32,
    pub base_cost: f64,
    pub material_cost: f64,
    pub electricity_cost: f64,
    pub depreciation_cost: f64,
    #[serde(default)]
    pub other_costs: f64,
    pub subtotal: f64,
    pub markup_multiplier: f64,
    pub markup: f64,
    pub post_processing_cost: f64,
    pub tax_rate: f64,
    pub tax: f64,
    pub total: f64,
    pub currency: String,
    pub currency_symbol: String,
}

/// Arithmetic runs in `Decimal` on the shortest decimal form of each input,
/// so configured prices such as `0.18` are taken at face value.
pub fn calculate_price(
    metrics: &PrintMetrics,
    material: &Material,
    printer: &Printer,
    pricing: &PricingConfig,
    quantity: u32,
    post_processing: &[&PostProcessingOption],
) -> Result<PriceBreakdown, PricingError> {
    let copies = Decimal::from(quantity);
    let hours = Decimal::from(metrics.print_time_s) / Decimal::from(3600);
    let thousand = Decimal::from(1000);

    let weight_kg = decimal("filament weight", metrics.filament_weight_g)? / thousand;
    let power_kw = decimal("printer power", pricing.printer_power_watts)? / thousand;

    let base_cost = line(decimal("base cost", pricing.base_cost)?, &[copies])?;
    let material_cost = line(
        weight_kg,
        &[decimal("material price", material.price_per_kg)?, copies],
    )?;
    let electricity_cost = line(
        hours,
        &[power_kw, decimal("electricity rate", pricing.electricity_rate_per_kwh)?, copies],
    )?;
    let depreciation_cost = line(
        hours,
        &[decimal("depreciation", pricing.depreciation_per_hour)?, copies],
    )?;
    let other_costs = line(decimal("other costs", pricing.other_costs_per_print)?, &[copies])?;

    let subtotal = sum(&[base_cost, material_cost, electricity_cost, depreciation_cost, other_costs])?;
    let multiplier = decimal("markup multiplier", printer.markup_multiplier)?;
    let markup = line(subtotal, &[multiplier - Decimal::ONE])?;

    let mut finishing_per_unit = Decimal::ZERO;
    for option in post_processing {
        finishing_per_unit = sum(&[finishing_per_unit, decimal("post-processing price", option.price)?])?;
    }
    let post_processing_cost = line(finishing_per_unit, &[copies])?;

    let taxable = sum(&[subtotal, markup, post_processing_cost])?;
    let tax = line(taxable, &[decimal("tax rate", pricing.tax_rate)?])?;
    let total = sum(&[taxable, tax])?;

    Ok(PriceBreakdown {
        quantity,
        base_cost: to_f64(base_cost)?,
        material_cost: to_f64(material_cost)?,
        electricity_cost: to_f64(electricity_cost)?,
        depreciation_cost: to_f64(depreciation_cost)?,
        other_costs: to_f64(other_costs)?,
        subtotal: to_f64(subtotal)?,
        markup_multiplier: printer.markup_multiplier,
        markup: to_f64(markup)?,
        post_processing_cost: to_f64(post_processing_cost)?,
        tax_rate: pricing.tax_rate,
        tax: to_f64(tax)?,
        total: to_f64(total)?,
        currency: pricing.currency.clone(),
        currency_symbol: pricing.currency_symbol.clone(),
    })
}

/// Half away from zero, 2 decimals.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Product of `first` and `factors`, rounded as a money line item.
fn line(first: Decimal, factors: &[Decimal]) -> Result<Decimal, PricingError> {
    factors
        .iter()
        .try_fold(first, |acc, f| acc.checked_mul(*f))
        .map(round_money)
        .ok_or(PricingError::OutOfRange("line item"))
}

fn sum(items: &[Decimal]) -> Result<Decimal, PricingError> {
    items
        .iter()
        .try_fold(Decimal::ZERO, |acc, item| acc.checked_add(*item))
        .ok_or(PricingError::OutOfRange("sum"))
}

/// `f64`'s `Display` is the shortest string that round-trips, so `1.005`
/// becomes exactly `1.005` rather than its binary neighbour.
fn decimal(field: &'static str, value: f64) -> Result<Decimal, PricingError> {
    if !value.is_finite() {
        return Err(PricingError::NotFinite(field));
    }
    Decimal::from_str(&value.to_string()).map_err(|_| PricingError::OutOfRange(field))
}

fn to_f64(value: Decimal) -> Result<f64, PricingError> {
    value
        .to_string()
        .parse()
        .map_err(|_| PricingError::OutOfRange("result"))
}
