//! Engine configuration.
//!
//! Defaults match a stock setup with three-decimal quantities and two-decimal
//! currency fields. Values can be overridden from the environment or from a
//! JSON document.

use anyhow::Context;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockline_core::{Precision, RoundingMode};

/// Decimal places per kind of field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    pub qty: Precision,
    pub transfer_qty: Precision,
    pub rate: Precision,
    pub amount: Precision,
    pub total: Precision,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        Self {
            qty: Precision::new(3),
            transfer_qty: Precision::new(3),
            rate: Precision::new(2),
            amount: Precision::new(2),
            total: Precision::new(2),
        }
    }
}

/// Configuration shared by both document engines.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub precision: PrecisionConfig,
    pub rounding: RoundingMode,
    /// Never open the batch/serial selector after an item is picked.
    pub hide_serial_batch_selector: bool,
}

impl EngineConfig {
    pub fn with_rounding(mut self, rounding: RoundingMode) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn with_precision(mut self, precision: PrecisionConfig) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_hidden_selector(mut self, hidden: bool) -> Self {
        self.hide_serial_batch_selector = hidden;
        self
    }

    /// Load overrides from `STOCKLINE_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load overrides through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup("STOCKLINE_HIDE_SERIAL_BATCH_SELECTOR") {
            config.hide_serial_batch_selector = parse_flag(&raw)
                .with_context(|| format!("STOCKLINE_HIDE_SERIAL_BATCH_SELECTOR={raw}"))?;
        }
        if let Some(raw) = lookup("STOCKLINE_ROUNDING") {
            config.rounding = raw
                .parse()
                .with_context(|| format!("STOCKLINE_ROUNDING={raw}"))?;
        }
        if let Some(raw) = lookup("STOCKLINE_QTY_PRECISION") {
            let places = parse_places("STOCKLINE_QTY_PRECISION", &raw)?;
            config.precision.qty = places;
            config.precision.transfer_qty = places;
        }
        if let Some(raw) = lookup("STOCKLINE_RATE_PRECISION") {
            config.precision.rate = parse_places("STOCKLINE_RATE_PRECISION", &raw)?;
        }
        if let Some(raw) = lookup("STOCKLINE_AMOUNT_PRECISION") {
            let places = parse_places("STOCKLINE_AMOUNT_PRECISION", &raw)?;
            config.precision.amount = places;
            config.precision.total = places;
        }

        Ok(config)
    }

    /// Parse a JSON document; missing keys keep their defaults.
    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).context("invalid engine configuration JSON")
    }

    pub fn round_qty(&self, value: Decimal) -> Decimal {
        self.precision.qty.round(value, self.rounding)
    }

    pub fn round_transfer_qty(&self, value: Decimal) -> Decimal {
        self.precision.transfer_qty.round(value, self.rounding)
    }

    pub fn round_rate(&self, value: Decimal) -> Decimal {
        self.precision.rate.round(value, self.rounding)
    }

    pub fn round_amount(&self, value: Decimal) -> Decimal {
        self.precision.amount.round(value, self.rounding)
    }

    pub fn round_total(&self, value: Decimal) -> Decimal {
        self.precision.total.round(value, self.rounding)
    }
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("expected a boolean flag, got {other:?}"),
    }
}

fn parse_places(name: &str, raw: &str) -> anyhow::Result<Precision> {
    let places: u32 = raw
        .trim()
        .parse()
        .with_context(|| format!("{name}={raw}"))?;
    Ok(Precision::new(places))
}
