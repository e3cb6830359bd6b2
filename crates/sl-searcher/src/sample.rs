//! Drawing, enumerating and perturbing points of a search space.

use rand::Rng;
use std::collections::BTreeMap;

use sl_types::{ConfigError, Hyperparameters, ParameterDef, ParameterKind, ParameterValue, SearchSpace, SlResult};

/// Draw one value for `param`. Constants consume no randomness.
pub fn sample_one<R: Rng + ?Sized>(param: &ParameterDef, rng: &mut R) -> ParameterValue {
    match &param.kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(rng.gen_range(*low..=*high)),
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.gen_range(*low..=*high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.gen_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterKind::Choice { values } => {
            let idx = rng.gen_range(0..values.len());
            ParameterValue::Json(values[idx].clone())
        }
        ParameterKind::Const { value } => ParameterValue::Json(value.clone()),
    }
}

/// Draw a full point, consuming randomness in declaration order.
pub fn sample_all<R: Rng + ?Sized>(space: &SearchSpace, rng: &mut R) -> Hyperparameters {
    space
        .parameters
        .iter()
        .map(|param| (param.name.clone(), sample_one(param, rng)))
        .collect()
}

fn linspace(low: f64, high: f64, count: usize) -> Vec<f64> {
    if count == 1 {
        return vec![(low + high) / 2.0];
    }
    (0..count)
        .map(|i| {
            if i == count - 1 {
                high
            } else {
                let t = i as f64 / (count - 1) as f64;
                low + t * (high - low)
            }
        })
        .collect()
}

fn axis(param: &ParameterDef, divisions: &BTreeMap<String, usize>) -> SlResult<Vec<ParameterValue>> {
    let count = || {
        divisions
            .get(&param.name)
            .copied()
            .filter(|n| *n > 0)
            .ok_or_else(|| ConfigError::MissingGridDivisions {
                name: param.name.clone(),
            })
    };

    let values = match &param.kind {
        ParameterKind::FloatRange { low, high } => linspace(*low, *high, count()?)
            .into_iter()
            .map(ParameterValue::Float)
            .collect(),
        ParameterKind::IntRange { low, high } => {
            let mut points: Vec<i64> = linspace(*low as f64, *high as f64, count()?)
                .into_iter()
                .map(|v| (v.round() as i64).clamp(*low, *high))
                .collect();
            points.dedup();
            points.into_iter().map(ParameterValue::Int).collect()
        }
        ParameterKind::LogUniform { low, high } => {
            let n = count()?;
            let mut points: Vec<f64> = linspace(low.ln(), high.ln(), n)
                .into_iter()
                .map(f64::exp)
                .collect();
            if n > 1 {
                points[0] = *low;
                points[n - 1] = *high;
            }
            points.into_iter().map(ParameterValue::Float).collect()
        }
        ParameterKind::Choice { values } => values
            .iter()
            .map(|v| ParameterValue::Json(v.clone()))
            .collect(),
        ParameterKind::Const { value } => vec![ParameterValue::Json(value.clone())],
    };
    Ok(values)
}

/// Fails when some parameter of `space` has no usable grid division, without
/// enumerating the grid.
pub fn check_grid_divisions(space: &SearchSpace, divisions: &BTreeMap<String, usize>) -> SlResult<()> {
    for param in &space.parameters {
        axis(param, divisions)?;
    }
    Ok(())
}

/// Every grid point, with the last declared parameter varying fastest.
pub fn grid(space: &SearchSpace, divisions: &BTreeMap<String, usize>) -> SlResult<Vec<Hyperparameters>> {
    let axes = space
        .parameters
        .iter()
        .map(|param| Ok((param.name.as_str(), axis(param, divisions)?)))
        .collect::<SlResult<Vec<_>>>()?;

    let mut result: Vec<Hyperparameters> = vec![Hyperparameters::new()];
    for (name, values) in &axes {
        let mut next = Vec::with_capacity(result.len() * values.len());
        for existing in &result {
            for value in values {
                let mut combo = existing.clone();
                combo.insert(name.to_string(), value.clone());
                next.push(combo);
            }
        }
        result = next;
    }
    Ok(result)
}

/// Explore around `old`: every searchable parameter is resampled with
/// probability `resample_probability`, otherwise numeric values are scaled by
/// `1 + perturb_factor` or `1 - perturb_factor` with equal odds and clamped
/// back into range. Categorical values are kept.
pub fn explore<R: Rng + ?Sized>(
    space: &SearchSpace,
    old: &Hyperparameters,
    resample_probability: f64,
    perturb_factor: f64,
    rng: &mut R,
) -> Hyperparameters {
    let mut explored = Hyperparameters::new();
    for param in &space.parameters {
        let value = match (&param.kind, old.get(&param.name)) {
            (ParameterKind::Const { value }, _) => ParameterValue::Json(value.clone()),
            (_, None) => sample_one(param, rng),
            (kind, Some(current)) => {
                if rng.gen::<f64>() < resample_probability {
                    sample_one(param, rng)
                } else {
                    perturb(kind, current, perturb_factor, rng)
                }
            }
        };
        explored.insert(param.name.clone(), value);
    }
    explored
}

fn perturb<R: Rng + ?Sized>(
    kind: &ParameterKind,
    current: &ParameterValue,
    perturb_factor: f64,
    rng: &mut R,
) -> ParameterValue {
    let scale = |rng: &mut R| {
        if rng.gen_bool(0.5) {
            1.0 + perturb_factor
        } else {
            1.0 - perturb_factor
        }
    };
    match (kind, current.as_f64()) {
        (ParameterKind::FloatRange { low, high }, Some(v))
        | (ParameterKind::LogUniform { low, high }, Some(v)) => {
            ParameterValue::Float((v * scale(rng)).clamp(*low, *high))
        }
        (ParameterKind::IntRange { low, high }, Some(v)) => {
            ParameterValue::Int(((v * scale(rng)).round() as i64).clamp(*low, *high))
        }
        _ => current.clone(),
    }
}
