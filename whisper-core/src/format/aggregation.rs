//! Aggregation methods used to consolidate finer points into coarser ones

use crate::{Result, WhisperError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Consolidation function stored in the file header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum AggregationMethod {
    #[default]
    Average = 1,
    Sum = 2,
    Last = 3,
    Max = 4,
    Min = 5,
    First = 6,
    /// Reserved for archive-level aggregation
    Mix = 7,
    /// Reserved for archive-level aggregation
    Percentile = 8,
}

impl AggregationMethod {
    /// Whether points can be consolidated with this method
    pub fn is_consolidating(self) -> bool {
        !matches!(self, AggregationMethod::Mix | AggregationMethod::Percentile)
    }

    /// Lower-case name as used in configuration files
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationMethod::Average => "average",
            AggregationMethod::Sum => "sum",
            AggregationMethod::Last => "last",
            AggregationMethod::Max => "max",
            AggregationMethod::Min => "min",
            AggregationMethod::First => "first",
            AggregationMethod::Mix => "mix",
            AggregationMethod::Percentile => "percentile",
        }
    }
}

impl TryFrom<u32> for AggregationMethod {
    type Error = WhisperError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(AggregationMethod::Average),
            2 => Ok(AggregationMethod::Sum),
            3 => Ok(AggregationMethod::Last),
            4 => Ok(AggregationMethod::Max),
            5 => Ok(AggregationMethod::Min),
            6 => Ok(AggregationMethod::First),
            7 => Ok(AggregationMethod::Mix),
            8 => Ok(AggregationMethod::Percentile),
            _ => Err(WhisperError::InvalidAggregationMethod(format!(
                "unknown code {}",
                value
            ))),
        }
    }
}

impl FromStr for AggregationMethod {
    type Err = WhisperError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "average" | "avg" => Ok(AggregationMethod::Average),
            "sum" => Ok(AggregationMethod::Sum),
            "last" => Ok(AggregationMethod::Last),
            "max" => Ok(AggregationMethod::Max),
            "min" => Ok(AggregationMethod::Min),
            "first" => Ok(AggregationMethod::First),
            "mix" => Ok(AggregationMethod::Mix),
            "percentile" => Ok(AggregationMethod::Percentile),
            _ => Err(WhisperError::InvalidAggregationMethod(s.to_string())),
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulator for computing aggregates incrementally
pub trait Accumulator: Send + Sync {
    /// Add a value to the accumulator
    fn add(&mut self, value: f64);

    /// Get the current result
    fn result(&self) -> Option<f64>;
}

/// Sum accumulator
#[derive(Debug, Default)]
pub struct SumAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for SumAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        if self.count > 0 {
            Some(self.sum)
        } else {
            None
        }
    }
}

/// Mean accumulator
#[derive(Debug, Default)]
pub struct MeanAccumulator {
    sum: f64,
    count: u64,
}

impl Accumulator for MeanAccumulator {
    fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        if self.count > 0 {
            Some(self.sum / self.count as f64)
        } else {
            None
        }
    }
}

/// Min accumulator
#[derive(Debug, Default)]
pub struct MinAccumulator {
    min: Option<f64>,
}

impl Accumulator for MinAccumulator {
    fn add(&mut self, value: f64) {
        self.min = Some(match self.min {
            Some(current) => current.min(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.min
    }
}

/// Max accumulator
#[derive(Debug, Default)]
pub struct MaxAccumulator {
    max: Option<f64>,
}

impl Accumulator for MaxAccumulator {
    fn add(&mut self, value: f64) {
        self.max = Some(match self.max {
            Some(current) => current.max(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.max
    }
}

/// Keeps the earliest value added; values arrive in time order
#[derive(Debug, Default)]
pub struct FirstAccumulator {
    value: Option<f64>,
}

impl Accumulator for FirstAccumulator {
    fn add(&mut self, value: f64) {
        if self.value.is_none() {
            self.value = Some(value);
        }
    }

    fn result(&self) -> Option<f64> {
        self.value
    }
}

/// Keeps the latest value added; values arrive in time order
#[derive(Debug, Default)]
pub struct LastAccumulator {
    value: Option<f64>,
}

impl Accumulator for LastAccumulator {
    fn add(&mut self, value: f64) {
        self.value = Some(value);
    }

    fn result(&self) -> Option<f64> {
        self.value
    }
}

/// Create the accumulator implementing `method`
pub fn accumulator_for(method: AggregationMethod) -> Result<Box<dyn Accumulator>> {
    let acc: Box<dyn Accumulator> = match method {
        AggregationMethod::Average => Box::new(MeanAccumulator::default()),
        AggregationMethod::Sum => Box::new(SumAccumulator::default()),
        AggregationMethod::Last => Box::new(LastAccumulator::default()),
        AggregationMethod::Max => Box::new(MaxAccumulator::default()),
        AggregationMethod::Min => Box::new(MinAccumulator::default()),
        AggregationMethod::First => Box::new(FirstAccumulator::default()),
        AggregationMethod::Mix | AggregationMethod::Percentile => {
            return Err(WhisperError::UnsupportedAggregation(method))
        }
    };
    Ok(acc)
}

/// Aggregate known values in time order; NaN when there are none
pub fn aggregate(method: AggregationMethod, values: &[f64]) -> Result<f64> {
    let mut acc = accumulator_for(method)?;
    for &value in values {
        acc.add(value);
    }
    Ok(acc.result().unwrap_or(f64::NAN))
}
