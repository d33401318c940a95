//! Batch expansion: one submitted action becomes N jobs.
//!
//! A [`BatchSpec`] varies up to four generation parameters. Each enabled
//! field contributes a list of values (explicit, or generated from the base
//! parameter with a fixed step) and the batch is the cartesian product of
//! those lists. Disabled fields keep the base value untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::Params;

// ---------------------------------------------------------------------------
// Parameter keys and limits
// ---------------------------------------------------------------------------

pub const SEED_KEY: &str = "seed";
pub const PROMPT_KEY: &str = "prompt";
pub const STEPS_KEY: &str = "steps";
pub const CFG_SCALE_KEY: &str = "cfg_scale";

/// Hard ceiling on jobs produced by one batch to prevent runaway matrices.
pub const MAX_BATCH_JOBS: usize = 500;

// ---------------------------------------------------------------------------
// Spec types
// ---------------------------------------------------------------------------

/// Where the values of an enabled field come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum ValueSource<T> {
    /// Use exactly these values, in order.
    List(Vec<T>),
    /// Generate `count` values: `base + i * step` for `i in 0..count`.
    Step(T),
}

/// Variation settings for one parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldVariation<T> {
    pub enabled: bool,
    pub source: ValueSource<T>,
}

impl<T> FieldVariation<T> {
    pub fn list(values: Vec<T>) -> Self {
        Self {
            enabled: true,
            source: ValueSource::List(values),
        }
    }

    pub fn step(step: T) -> Self {
        Self {
            enabled: true,
            source: ValueSource::Step(step),
        }
    }
}

impl<T> Default for FieldVariation<T> {
    fn default() -> Self {
        Self {
            enabled: false,
            source: ValueSource::List(Vec::new()),
        }
    }
}

/// Describes how one submitted action expands into jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpec {
    /// Number of values produced by each step generator.
    pub count: u32,
    #[serde(default)]
    pub seed: FieldVariation<i64>,
    /// Prompts only support explicit lists.
    #[serde(default)]
    pub prompt: FieldVariation<String>,
    #[serde(default)]
    pub steps: FieldVariation<i64>,
    #[serde(default)]
    pub cfg_scale: FieldVariation<f64>,
}

impl Default for BatchSpec {
    fn default() -> Self {
        Self {
            count: 1,
            seed: FieldVariation::default(),
            prompt: FieldVariation::default(),
            steps: FieldVariation::default(),
            cfg_scale: FieldVariation::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Value generation
// ---------------------------------------------------------------------------

trait BatchValue: Clone + Into<Value> {
    fn from_param(value: &Value) -> Option<Self>;
    fn nth(base: &Self, step: &Self, i: u32) -> Option<Self>;
}

impl BatchValue for i64 {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_i64()
    }

    fn nth(base: &Self, step: &Self, i: u32) -> Option<Self> {
        step.checked_mul(i64::from(i))
            .and_then(|offset| base.checked_add(offset))
    }
}

impl BatchValue for f64 {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_f64()
    }

    fn nth(base: &Self, step: &Self, i: u32) -> Option<Self> {
        let v = base + step * f64::from(i);
        v.is_finite().then_some(v)
    }
}

impl BatchValue for String {
    fn from_param(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }

    fn nth(_base: &Self, _step: &Self, _i: u32) -> Option<Self> {
        None
    }
}

/// Resolve the value list for one field, or `None` when the field does not
/// vary (disabled, or enabled with an empty explicit list).
fn field_values<T: BatchValue>(
    key: &'static str,
    base: &Params,
    variation: &FieldVariation<T>,
    count: u32,
) -> Result<Option<Vec<Value>>, CoreError> {
    if !variation.enabled {
        return Ok(None);
    }

    match &variation.source {
        ValueSource::List(values) if values.is_empty() => Ok(None),
        ValueSource::List(values) => Ok(Some(values.iter().cloned().map(Into::into).collect())),
        ValueSource::Step(step) => {
            if count == 0 {
                return Err(CoreError::Validation(format!(
                    "Batch count must be at least 1 to generate '{key}' values"
                )));
            }
            let start = base.get(key).and_then(T::from_param).ok_or_else(|| {
                CoreError::Validation(format!(
                    "Base parameter '{key}' is missing or has the wrong type for a stepped variation"
                ))
            })?;
            (0..count)
                .map(|i| {
                    T::nth(&start, step, i).map(Into::into).ok_or_else(|| {
                        CoreError::Validation(format!(
                            "Cannot generate value {i} for '{key}' from a step"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some)
        }
    }
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// Expand `base` into one parameter set per batch cell.
///
/// Product order is seed (outermost), prompt, steps, cfg_scale (innermost).
/// With every field disabled the result is exactly `[base]`.
pub fn expand_batch(base: &Params, spec: &BatchSpec) -> Result<Vec<Params>, CoreError> {
    let fields = [
        (SEED_KEY, field_values(SEED_KEY, base, &spec.seed, spec.count)?),
        (PROMPT_KEY, field_values(PROMPT_KEY, base, &spec.prompt, spec.count)?),
        (STEPS_KEY, field_values(STEPS_KEY, base, &spec.steps, spec.count)?),
        (
            CFG_SCALE_KEY,
            field_values(CFG_SCALE_KEY, base, &spec.cfg_scale, spec.count)?,
        ),
    ];

    let total = fields
        .iter()
        .filter_map(|(_, values)| values.as_ref().map(Vec::len))
        .try_fold(1usize, usize::checked_mul)
        .filter(|&n| n <= MAX_BATCH_JOBS)
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "Batch expands to more than {MAX_BATCH_JOBS} jobs"
            ))
        })?;

    let mut expanded = Vec::with_capacity(total);
    expanded.push(base.clone());

    for (key, values) in fields {
        let Some(values) = values else { continue };
        expanded = expanded
            .into_iter()
            .flat_map(|params| {
                values.iter().map(move |value| {
                    let mut cell = params.clone();
                    cell.insert(key.to_string(), value.clone());
                    cell
                })
            })
            .collect();
    }

    Ok(expanded)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
