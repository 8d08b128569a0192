//! Function registry for the expression engine (§4.G step 4): math, string,
//! time, cast, statistical, quality, pattern, geodesic, vector, array,
//! matrix, timeseries, and generic composite functions.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use regex::Regex;
use thiserror::Error;

use super::expr::value::ExprValue;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FunctionError {
    #[error("unknown function: {0}")]
    Unknown(String),
    #[error("{0} expects {1} argument(s)")]
    Arity(String, usize),
    #[error("{0}: invalid argument type")]
    BadArgument(String),
    #[error("invalid regex pattern: {0}")]
    BadRegex(String),
}

const REGEX_CACHE_CAP: usize = 1000;

/// Holds mutable state shared across calls: the capped, double-checked
/// regex cache (§5).
pub struct FunctionRegistry {
    regex_cache: RwLock<HashMap<String, Regex>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self {
            regex_cache: RwLock::new(HashMap::new()),
        }
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call(&self, name: &str, args: &[ExprValue]) -> Result<ExprValue, FunctionError> {
        match name {
            // math
            "abs" => unary_num(name, args, f64::abs),
            "sqrt" => unary_num(name, args, f64::sqrt),
            "floor" => unary_num(name, args, f64::floor),
            "ceil" => unary_num(name, args, f64::ceil),
            "max" => binary_num(name, args, f64::max),
            "min" => binary_num(name, args, f64::min),
            "pow" => binary_num(name, args, f64::powf),

            // string
            "len" => {
                let s = arg_str(name, args, 0)?;
                Ok(ExprValue::Number(s.chars().count() as f64))
            }
            "upper" => Ok(ExprValue::Str(arg_str(name, args, 0)?.to_uppercase())),
            "lower" => Ok(ExprValue::Str(arg_str(name, args, 0)?.to_lowercase())),
            "contains" => {
                let (hay, needle) = (arg_str(name, args, 0)?, arg_str(name, args, 1)?);
                Ok(ExprValue::Bool(hay.contains(&needle)))
            }
            "startsWith" => {
                let (hay, needle) = (arg_str(name, args, 0)?, arg_str(name, args, 1)?);
                Ok(ExprValue::Bool(hay.starts_with(&needle)))
            }
            "endsWith" => {
                let (hay, needle) = (arg_str(name, args, 0)?, arg_str(name, args, 1)?);
                Ok(ExprValue::Bool(hay.ends_with(&needle)))
            }

            // time
            "now" => Ok(ExprValue::Number(Utc::now().timestamp() as f64)),
            "timeFormat" => {
                let ts = arg_num(name, args, 0)?;
                let dt = chrono::DateTime::from_timestamp(ts as i64, 0)
                    .ok_or_else(|| FunctionError::BadArgument(name.into()))?;
                Ok(ExprValue::Str(dt.to_rfc3339()))
            }
            "timeDiff" => {
                let (a, b) = (arg_num(name, args, 0)?, arg_num(name, args, 1)?);
                Ok(ExprValue::Number(a - b))
            }
            "time_range" => {
                let (ts, lo, hi) = (arg_num(name, args, 0)?, arg_num(name, args, 1)?, arg_num(name, args, 2)?);
                Ok(ExprValue::Bool(ts >= lo && ts <= hi))
            }

            // cast
            "toString" => Ok(ExprValue::Str(args.first().map(ExprValue::as_str_repr).unwrap_or_default())),
            "toNumber" => Ok(ExprValue::Number(
                args.first().and_then(ExprValue::as_number).unwrap_or(f64::NAN),
            )),
            "toBool" => Ok(ExprValue::Bool(args.first().map(ExprValue::as_bool).unwrap_or(false))),

            // statistical
            "avg" => {
                let values = arg_numbers(name, args)?;
                Ok(ExprValue::Number(mean(&values)))
            }
            "stddev" => {
                let values = arg_numbers(name, args)?;
                Ok(ExprValue::Number(stddev(&values)))
            }

            // quality
            "isNaN" => Ok(ExprValue::Bool(arg_num(name, args, 0)?.is_nan())),
            "isInf" => Ok(ExprValue::Bool(arg_num(name, args, 0)?.is_infinite())),
            "isFinite" => Ok(ExprValue::Bool(arg_num(name, args, 0)?.is_finite())),

            // pattern
            "regex" => {
                let (pattern, text) = (arg_str(name, args, 0)?, arg_str(name, args, 1)?);
                Ok(ExprValue::Bool(self.regex_match(&pattern, &text)?))
            }

            // geodesic
            "distance" => {
                let (lat1, lon1, lat2, lon2) = (
                    arg_num(name, args, 0)?,
                    arg_num(name, args, 1)?,
                    arg_num(name, args, 2)?,
                    arg_num(name, args, 3)?,
                );
                Ok(ExprValue::Number(haversine_km(lat1, lon1, lat2, lon2)))
            }
            "in_region" => {
                let (lat, lon, clat, clon, radius_km) = (
                    arg_num(name, args, 0)?,
                    arg_num(name, args, 1)?,
                    arg_num(name, args, 2)?,
                    arg_num(name, args, 3)?,
                    arg_num(name, args, 4)?,
                );
                Ok(ExprValue::Bool(haversine_km(lat, lon, clat, clon) <= radius_km))
            }
            "nearest_region" => {
                // args: lat, lon, then (clat, clon) pairs.
                let lat = arg_num(name, args, 0)?;
                let lon = arg_num(name, args, 1)?;
                let mut best = f64::INFINITY;
                let mut idx = -1.0;
                let mut pair = 0;
                let mut i = 2;
                while i + 1 < args.len() {
                    let d = haversine_km(lat, lon, arg_num(name, args, i)?, arg_num(name, args, i + 1)?);
                    if d < best {
                        best = d;
                        idx = pair as f64;
                    }
                    pair += 1;
                    i += 2;
                }
                Ok(ExprValue::Number(idx))
            }
            "bearing" => {
                let (lat1, lon1, lat2, lon2) = (
                    arg_num(name, args, 0)?,
                    arg_num(name, args, 1)?,
                    arg_num(name, args, 2)?,
                    arg_num(name, args, 3)?,
                );
                Ok(ExprValue::Number(bearing_deg(lat1, lon1, lat2, lon2)))
            }
            "valid_coordinate" => {
                let (lat, lon) = (arg_num(name, args, 0)?, arg_num(name, args, 1)?);
                Ok(ExprValue::Bool((-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)))
            }

            // vector (3D convenience)
            "vectorMagnitude3D" => {
                let (x, y, z) = (arg_num(name, args, 0)?, arg_num(name, args, 1)?, arg_num(name, args, 2)?);
                Ok(ExprValue::Number((x * x + y * y + z * z).sqrt()))
            }
            "vectorDotProduct3D" => {
                let (x1, y1, z1, x2, y2, z2) = (
                    arg_num(name, args, 0)?,
                    arg_num(name, args, 1)?,
                    arg_num(name, args, 2)?,
                    arg_num(name, args, 3)?,
                    arg_num(name, args, 4)?,
                    arg_num(name, args, 5)?,
                );
                Ok(ExprValue::Number(x1 * x2 + y1 * y2 + z1 * z2))
            }
            "vectorCross3D" => {
                let (x1, y1, z1, x2, y2, z2) = (
                    arg_num(name, args, 0)?,
                    arg_num(name, args, 1)?,
                    arg_num(name, args, 2)?,
                    arg_num(name, args, 3)?,
                    arg_num(name, args, 4)?,
                    arg_num(name, args, 5)?,
                );
                Ok(ExprValue::Array(vec![
                    y1 * z2 - z1 * y2,
                    z1 * x2 - x1 * z2,
                    x1 * y2 - y1 * x2,
                ]))
            }

            // vector (generic, array-based)
            "vectorMagnitude" => {
                let v = arg_array(name, args, 0)?;
                Ok(ExprValue::Number(v.iter().map(|x| x * x).sum::<f64>().sqrt()))
            }
            "vectorSum" => Ok(ExprValue::Number(arg_array(name, args, 0)?.iter().sum())),
            "vectorMean" => Ok(ExprValue::Number(mean(&arg_array(name, args, 0)?))),
            "vectorMin" => Ok(ExprValue::Number(min_of(&arg_array(name, args, 0)?))),
            "vectorMax" => Ok(ExprValue::Number(max_of(&arg_array(name, args, 0)?))),
            "vectorDotProduct" => {
                let (a, b) = (arg_array(name, args, 0)?, arg_array(name, args, 1)?);
                Ok(ExprValue::Number(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()))
            }
            "vectorNormalize" => {
                let v = arg_array(name, args, 0)?;
                let mag = v.iter().map(|x| x * x).sum::<f64>().sqrt();
                if mag == 0.0 {
                    Ok(ExprValue::Array(v))
                } else {
                    Ok(ExprValue::Array(v.into_iter().map(|x| x / mag).collect()))
                }
            }

            // array
            "arrayLength" => Ok(ExprValue::Number(arg_array(name, args, 0)?.len() as f64)),
            "arraySum" => Ok(ExprValue::Number(arg_array(name, args, 0)?.iter().sum())),
            "arrayMean" => Ok(ExprValue::Number(mean(&arg_array(name, args, 0)?))),
            "arrayMin" => Ok(ExprValue::Number(min_of(&arg_array(name, args, 0)?))),
            "arrayMax" => Ok(ExprValue::Number(max_of(&arg_array(name, args, 0)?))),
            "arrayCount" => {
                let v = arg_array(name, args, 0)?;
                let target = arg_num(name, args, 1)?;
                Ok(ExprValue::Number(v.iter().filter(|x| **x == target).count() as f64))
            }
            "arrayGet" => {
                let v = arg_array(name, args, 0)?;
                let idx = arg_num(name, args, 1)? as i64;
                Ok(ExprValue::Number(index_into(&v, idx).unwrap_or(f64::NAN)))
            }

            // matrix (flattened row-major `data`, plus `rows`)
            "matrixTrace" => {
                let data = arg_array(name, args, 0)?;
                let rows = arg_num(name, args, 1)? as usize;
                if rows == 0 {
                    return Ok(ExprValue::Number(0.0));
                }
                let trace = (0..rows).map(|i| data.get(i * rows + i).copied().unwrap_or(0.0)).sum();
                Ok(ExprValue::Number(trace))
            }
            "matrixDeterminant" => {
                let data = arg_array(name, args, 0)?;
                let rows = arg_num(name, args, 1)? as usize;
                if rows > 3 {
                    return Err(FunctionError::BadArgument(
                        "matrixDeterminant only supports up to 3x3".into(),
                    ));
                }
                Ok(ExprValue::Number(determinant(&data, rows)))
            }
            "matrixSum" => Ok(ExprValue::Number(arg_array(name, args, 0)?.iter().sum())),
            "matrixMean" => Ok(ExprValue::Number(mean(&arg_array(name, args, 0)?))),
            "matrixGet" => {
                let data = arg_array(name, args, 0)?;
                let (cols, row, col) = (
                    arg_num(name, args, 1)? as usize,
                    arg_num(name, args, 2)? as usize,
                    arg_num(name, args, 3)? as usize,
                );
                Ok(ExprValue::Number(data.get(row * cols + col).copied().unwrap_or(f64::NAN)))
            }

            // timeseries
            "timeSeriesLength" => Ok(ExprValue::Number(arg_array(name, args, 0)?.len() as f64)),
            "timeSeriesMean" => Ok(ExprValue::Number(mean(&arg_array(name, args, 0)?))),
            "timeSeriesMin" => Ok(ExprValue::Number(min_of(&arg_array(name, args, 0)?))),
            "timeSeriesMax" => Ok(ExprValue::Number(max_of(&arg_array(name, args, 0)?))),
            "timeSeriesTrend" => Ok(ExprValue::Number(least_squares_slope(&arg_array(name, args, 0)?))),
            "timeSeriesVariance" => Ok(ExprValue::Number(variance(&arg_array(name, args, 0)?))),
            "timeSeriesStdDev" => Ok(ExprValue::Number(stddev(&arg_array(name, args, 0)?))),

            // generic composite
            "compositeType" => match args.first() {
                Some(ExprValue::Array(_)) => Ok(ExprValue::Str("array".into())),
                Some(ExprValue::Number(_)) => Ok(ExprValue::Str("number".into())),
                Some(ExprValue::Bool(_)) => Ok(ExprValue::Str("bool".into())),
                Some(ExprValue::Str(_)) => Ok(ExprValue::Str("string".into())),
                None => Ok(ExprValue::Str("unknown".into())),
            },
            "compositeSize" => match args.first() {
                Some(ExprValue::Array(a)) => Ok(ExprValue::Number(a.len() as f64)),
                _ => Ok(ExprValue::Number(0.0)),
            },
            "compositeValidate" => match args.first() {
                Some(ExprValue::Array(a)) => Ok(ExprValue::Bool(!a.is_empty())),
                Some(_) => Ok(ExprValue::Bool(true)),
                None => Ok(ExprValue::Bool(false)),
            },

            other => Err(FunctionError::Unknown(other.to_string())),
        }
    }

    fn regex_match(&self, pattern: &str, text: &str) -> Result<bool, FunctionError> {
        if let Some(re) = self.regex_cache.read().get(pattern) {
            return Ok(re.is_match(text));
        }
        let re = Regex::new(pattern).map_err(|e| FunctionError::BadRegex(e.to_string()))?;
        {
            let mut cache = self.regex_cache.write();
            if cache.len() >= REGEX_CACHE_CAP {
                cache.clear();
            }
            cache.entry(pattern.to_string()).or_insert_with(|| re.clone());
        }
        Ok(re.is_match(text))
    }
}

fn unary_num(name: &str, args: &[ExprValue], f: impl Fn(f64) -> f64) -> Result<ExprValue, FunctionError> {
    Ok(ExprValue::Number(f(arg_num(name, args, 0)?)))
}

fn binary_num(name: &str, args: &[ExprValue], f: impl Fn(f64, f64) -> f64) -> Result<ExprValue, FunctionError> {
    Ok(ExprValue::Number(f(arg_num(name, args, 0)?, arg_num(name, args, 1)?)))
}

fn arg_num(name: &str, args: &[ExprValue], idx: usize) -> Result<f64, FunctionError> {
    args.get(idx)
        .and_then(ExprValue::as_number)
        .ok_or_else(|| FunctionError::Arity(name.to_string(), idx + 1))
}

fn arg_str(name: &str, args: &[ExprValue], idx: usize) -> Result<String, FunctionError> {
    args.get(idx)
        .map(ExprValue::as_str_repr)
        .ok_or_else(|| FunctionError::Arity(name.to_string(), idx + 1))
}

fn arg_array(name: &str, args: &[ExprValue], idx: usize) -> Result<Vec<f64>, FunctionError> {
    match args.get(idx) {
        Some(ExprValue::Array(v)) => Ok(v.clone()),
        _ => Err(FunctionError::BadArgument(name.to_string())),
    }
}

fn arg_numbers(name: &str, args: &[ExprValue]) -> Result<Vec<f64>, FunctionError> {
    if args.len() == 1 {
        if let ExprValue::Array(v) = &args[0] {
            return Ok(v.clone());
        }
    }
    args.iter()
        .map(|a| a.as_number().ok_or_else(|| FunctionError::BadArgument(name.to_string())))
        .collect()
}

fn index_into(v: &[f64], idx: i64) -> Option<f64> {
    if idx >= 0 {
        v.get(idx as usize).copied()
    } else {
        let from_end = (-idx) as usize;
        if from_end > v.len() {
            None
        } else {
            v.get(v.len() - from_end).copied()
        }
    }
}

fn mean(v: &[f64]) -> f64 {
    if v.is_empty() {
        return f64::NAN;
    }
    v.iter().sum::<f64>() / v.len() as f64
}

fn variance(v: &[f64]) -> f64 {
    if v.len() < 2 {
        return 0.0;
    }
    let m = mean(v);
    v.iter().map(|x| (x - m).powi(2)).sum::<f64>() / v.len() as f64
}

fn stddev(v: &[f64]) -> f64 {
    variance(v).sqrt()
}

fn min_of(v: &[f64]) -> f64 {
    v.iter().cloned().fold(f64::INFINITY, f64::min)
}

fn max_of(v: &[f64]) -> f64 {
    v.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
}

fn least_squares_slope(v: &[f64]) -> f64 {
    let n = v.len();
    if n < 2 {
        return 0.0;
    }
    let xs: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let x_mean = mean(&xs);
    let y_mean = mean(v);
    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..n {
        num += (xs[i] - x_mean) * (v[i] - y_mean);
        den += (xs[i] - x_mean).powi(2);
    }
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn determinant(data: &[f64], rows: usize) -> f64 {
    match rows {
        0 => 0.0,
        1 => data.first().copied().unwrap_or(0.0),
        2 => data[0] * data[3] - data[1] * data[2],
        3 => {
            data[0] * (data[4] * data[8] - data[5] * data[7])
                - data[1] * (data[3] * data[8] - data[5] * data[6])
                + data[2] * (data[3] * data[7] - data[4] * data[6])
        }
        _ => f64::NAN,
    }
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1r, lat2r) = (lat1.to_radians(), lat2.to_radians());
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1r.cos() * lat2r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1r, lat2r) = (lat1.to_radians(), lat2.to_radians());
    let dlon = (lon2 - lon1).to_radians();
    let y = dlon.sin() * lat2r.cos();
    let x = lat1r.cos() * lat2r.sin() - lat1r.sin() * lat2r.cos() * dlon.cos();
    let theta = y.atan2(x).to_degrees();
    (theta + 360.0) % 360.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_functions_cover_basic_cases() {
        let reg = FunctionRegistry::new();
        assert_eq!(reg.call("abs", &[ExprValue::Number(-4.0)]).unwrap(), ExprValue::Number(4.0));
        assert_eq!(
            reg.call("max", &[ExprValue::Number(1.0), ExprValue::Number(5.0)]).unwrap(),
            ExprValue::Number(5.0)
        );
    }

    #[test]
    fn regex_cache_evicts_on_overflow() {
        let reg = FunctionRegistry::new();
        for i in 0..REGEX_CACHE_CAP + 10 {
            let pattern = format!("pat{i}");
            let _ = reg.call("regex", &[ExprValue::Str(pattern), ExprValue::Str("x".into())]);
        }
        assert!(reg.regex_cache.read().len() <= REGEX_CACHE_CAP);
    }

    #[test]
    fn distance_between_identical_points_is_zero() {
        let reg = FunctionRegistry::new();
        let d = reg
            .call(
                "distance",
                &[
                    ExprValue::Number(10.0),
                    ExprValue::Number(20.0),
                    ExprValue::Number(10.0),
                    ExprValue::Number(20.0),
                ],
            )
            .unwrap();
        assert_eq!(d, ExprValue::Number(0.0));
    }

    #[test]
    fn vector_magnitude_matches_pythagoras() {
        let reg = FunctionRegistry::new();
        let v = reg
            .call("vectorMagnitude3D", &[ExprValue::Number(3.0), ExprValue::Number(4.0), ExprValue::Number(0.0)])
            .unwrap();
        assert_eq!(v, ExprValue::Number(5.0));
    }

    #[test]
    fn unknown_function_errors() {
        let reg = FunctionRegistry::new();
        assert!(matches!(reg.call("nope", &[]), Err(FunctionError::Unknown(_))));
    }
}
