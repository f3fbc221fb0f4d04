//! Per-feature summary statistics and their exact combination.
//!
//! Episode-level records are merged with count weighting: means are weighted
//! by frame count and standard deviations are pooled from each episode's
//! variance plus the spread of its mean around the combined mean, so the
//! aggregate matches what a single pass over all frames would produce.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Feature key -> statistics for that feature.
pub type StatisticRecord = BTreeMap<String, FeatureStats>;

#[derive(Debug, Error, PartialEq)]
pub enum StatsError {
    #[error("cannot aggregate an empty set of statistic records")]
    EmptyAggregation,
    #[error("statistic records disagree on feature keys: {feature} is not present in every record")]
    FeatureMismatch { feature: String },
    #[error("shape mismatch for {feature}.{field}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        feature: String,
        field: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("feature {feature} has a total count of zero")]
    ZeroCount { feature: String },
}

/// Dense numeric array of any rank, stored row-major.
///
/// An array parsed from JSON remembers its source text and is written back
/// verbatim, so integer entries like `[0]` are not re-rendered as `[0.0]`.
/// Computed arrays are written from their `f64` values. Equality compares
/// shape and values only.
#[derive(Debug, Clone)]
pub struct StatArray {
    shape: Vec<usize>,
    values: Vec<f64>,
    source: Option<Value>,
}

impl PartialEq for StatArray {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.values == other.values
    }
}

impl StatArray {
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, String> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(format!(
                "shape {shape:?} needs {expected} values, got {}",
                values.len()
            ));
        }
        Ok(Self {
            shape,
            values,
            source: None,
        })
    }

    pub fn scalar(value: f64) -> Self {
        Self {
            shape: Vec::new(),
            values: vec![value],
            source: None,
        }
    }

    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
            source: None,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    fn filled(shape: &[usize], value: f64) -> Self {
        Self {
            shape: shape.to_vec(),
            values: vec![value; shape.iter().product()],
            source: None,
        }
    }

    /// Same numbers without the remembered source text.
    fn computed(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            values: self.values.clone(),
            source: None,
        }
    }

    fn from_json(value: Value) -> Result<Self, String> {
        let mut values = Vec::new();
        let shape = collect_nested(&value, &mut values)?;
        Ok(Self {
            shape,
            values,
            source: Some(value),
        })
    }

    fn to_json(&self) -> Value {
        fn build(shape: &[usize], values: &[f64]) -> Value {
            match shape.split_first() {
                None => float_value(values[0]),
                Some((&len, rest)) => {
                    let stride: usize = rest.iter().product();
                    Value::Array(
                        (0..len)
                            .map(|idx| build(rest, &values[idx * stride..(idx + 1) * stride]))
                            .collect(),
                    )
                }
            }
        }
        build(&self.shape, &self.values)
    }
}

fn float_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn collect_nested(value: &Value, out: &mut Vec<f64>) -> Result<Vec<usize>, String> {
    match value {
        Value::Number(number) => {
            let number = number
                .as_f64()
                .ok_or_else(|| format!("number {number} is not representable as f64"))?;
            out.push(number);
            Ok(Vec::new())
        }
        Value::Null => {
            out.push(f64::NAN);
            Ok(Vec::new())
        }
        Value::Array(items) => {
            let mut inner: Option<Vec<usize>> = None;
            for item in items {
                let shape = collect_nested(item, out)?;
                match &inner {
                    None => inner = Some(shape),
                    Some(existing) if *existing != shape => {
                        return Err(format!(
                            "ragged array: expected inner shape {existing:?}, found {shape:?}"
                        ));
                    }
                    Some(_) => {}
                }
            }
            let mut shape = vec![items.len()];
            shape.extend(inner.unwrap_or_default());
            Ok(shape)
        }
        other => Err(format!("expected a number or nested array, got {other}")),
    }
}

impl Serialize for StatArray {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match &self.source {
            Some(source) => source.serialize(serializer),
            None => self.to_json().serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StatArray {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        StatArray::from_json(value).map_err(serde::de::Error::custom)
    }
}

/// Summary statistics of one feature over one episode or a whole dataset.
///
/// Additional per-feature entries (quantiles and the like) are kept verbatim
/// on episode records but cannot be combined exactly, so aggregation drops
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub min: StatArray,
    pub max: StatArray,
    pub mean: StatArray,
    pub std: StatArray,
    #[serde(serialize_with = "serialize_count", deserialize_with = "deserialize_count")]
    pub count: u64,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn serialize_count<S>(count: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    [*count].serialize(serializer)
}

/// Accepts either a bare integer or a one-element array.
fn deserialize_count<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    let scalar = match &val {
        Value::Array(items) if items.len() == 1 => &items[0],
        Value::Array(_) => {
            return Err(serde::de::Error::custom(
                "expected a single-element array for count",
            ))
        }
        other => other,
    };
    match scalar {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
            .ok_or_else(|| serde::de::Error::custom("count must be a non-negative integer")),
        _ => Err(serde::de::Error::custom("expected number for count")),
    }
}

/// Combines per-episode statistic records into one dataset-level record.
pub fn aggregate_stats<'a, I>(records: I) -> Result<StatisticRecord, StatsError>
where
    I: IntoIterator<Item = &'a StatisticRecord>,
{
    let records: Vec<&StatisticRecord> = records.into_iter().collect();
    let Some(first) = records.first() else {
        return Err(StatsError::EmptyAggregation);
    };

    let keys: BTreeSet<&String> = first.keys().collect();
    for record in &records[1..] {
        if let Some(feature) = record
            .keys()
            .find(|key| !keys.contains(key))
            .or_else(|| keys.iter().copied().find(|key| !record.contains_key(*key)))
        {
            return Err(StatsError::FeatureMismatch {
                feature: feature.clone(),
            });
        }
    }

    let mut aggregated = StatisticRecord::new();
    for key in keys {
        let per_episode: Vec<&FeatureStats> = records.iter().map(|record| &record[key]).collect();
        aggregated.insert(key.clone(), aggregate_feature(key, &per_episode)?);
    }
    Ok(aggregated)
}

fn aggregate_feature(feature: &str, stats: &[&FeatureStats]) -> Result<FeatureStats, StatsError> {
    let first = stats[0];
    for entry in stats {
        check_shape(feature, "min", &first.min, &entry.min)?;
        check_shape(feature, "max", &first.max, &entry.max)?;
        check_shape(feature, "mean", &first.mean, &entry.mean)?;
        check_shape(feature, "std", &first.mean, &entry.std)?;
    }

    let total_count: u64 = stats.iter().map(|entry| entry.count).sum();
    if total_count == 0 {
        return Err(StatsError::ZeroCount {
            feature: feature.to_string(),
        });
    }
    let total = total_count as f64;

    let mut mean = StatArray::filled(first.mean.shape(), 0.0);
    for entry in stats {
        let weight = entry.count as f64;
        for (acc, value) in mean.values.iter_mut().zip(&entry.mean.values) {
            *acc += value * weight;
        }
    }
    for acc in &mut mean.values {
        *acc /= total;
    }

    let mut variance = StatArray::filled(first.mean.shape(), 0.0);
    for entry in stats {
        let weight = entry.count as f64;
        for ((acc, (m, s)), pooled_mean) in variance
            .values
            .iter_mut()
            .zip(entry.mean.values.iter().zip(&entry.std.values))
            .zip(&mean.values)
        {
            let delta = m - pooled_mean;
            *acc += (s * s + delta * delta) * weight;
        }
    }
    let std = StatArray {
        shape: variance.shape,
        values: variance
            .values
            .into_iter()
            .map(|acc| (acc / total).max(0.0).sqrt())
            .collect(),
        source: None,
    };

    let mut min = first.min.computed();
    let mut max = first.max.computed();
    for entry in &stats[1..] {
        for (acc, value) in min.values.iter_mut().zip(&entry.min.values) {
            *acc = acc.min(*value);
        }
        for (acc, value) in max.values.iter_mut().zip(&entry.max.values) {
            *acc = acc.max(*value);
        }
    }

    Ok(FeatureStats {
        min,
        max,
        mean,
        std,
        count: total_count,
        extra: BTreeMap::new(),
    })
}

fn check_shape(
    feature: &str,
    field: &'static str,
    expected: &StatArray,
    found: &StatArray,
) -> Result<(), StatsError> {
    if expected.shape() == found.shape() {
        return Ok(());
    }
    Err(StatsError::ShapeMismatch {
        feature: feature.to_string(),
        field,
        expected: expected.shape().to_vec(),
        found: found.shape().to_vec(),
    })
}
