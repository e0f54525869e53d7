//! Search space declaration and normalization.
//!
//! A [`ParameterSpace`] is the declarative description of every tunable
//! input. It can be built programmatically with the chained `add_*` methods
//! or normalized from a raw JSON grid via [`ParameterSpace::from_spec`],
//! which accepts the two shapes strategy configs use in the wild:
//!
//! - a plain array of admissible values (categorical), or
//! - a range object `{"kind": "int"|"float", "low": .., "high": ..,
//!   "step": .., "log": ..}`.

use pf_types::{ParamValue, PfError, PfResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name (e.g. "short_period"). Unique within a space.
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous range `[low, high]`; `step` restricts to a grid, `log`
    /// requests log-uniform proposal density.
    Float {
        low: f64,
        high: f64,
        step: Option<f64>,
        log: bool,
    },
    /// Integer range `[low, high]` inclusive, on the lattice
    /// `low, low+step, low+2*step, ...`.
    Int {
        low: i64,
        high: i64,
        step: i64,
        log: bool,
    },
    /// Ordered categorical choices.
    Choice { values: Vec<serde_json::Value> },
}

impl ParameterKind {
    fn validate(&self, name: &str) -> PfResult<()> {
        match self {
            Self::Float {
                low,
                high,
                step,
                log,
            } => {
                if !low.is_finite() || !high.is_finite() {
                    return Err(spec_err(format!("'{name}': bounds must be finite")));
                }
                if low > high {
                    return Err(spec_err(format!("'{name}': low {low} > high {high}")));
                }
                if let Some(s) = step {
                    if !s.is_finite() || *s <= 0.0 {
                        return Err(spec_err(format!("'{name}': step must be positive")));
                    }
                    if *log {
                        return Err(spec_err(format!(
                            "'{name}': log and step cannot be combined"
                        )));
                    }
                }
                if *log && *low <= 0.0 {
                    return Err(spec_err(format!(
                        "'{name}': log range requires low > 0, got {low}"
                    )));
                }
                Ok(())
            }
            Self::Int {
                low,
                high,
                step,
                log,
            } => {
                if low > high {
                    return Err(spec_err(format!("'{name}': low {low} > high {high}")));
                }
                if *step < 1 {
                    return Err(spec_err(format!("'{name}': step must be >= 1")));
                }
                if *log {
                    if *low < 1 {
                        return Err(spec_err(format!(
                            "'{name}': log range requires low >= 1, got {low}"
                        )));
                    }
                    if *step != 1 {
                        return Err(spec_err(format!(
                            "'{name}': log and step cannot be combined"
                        )));
                    }
                }
                Ok(())
            }
            Self::Choice { values } => {
                if values.is_empty() {
                    return Err(spec_err(format!("'{name}': empty choice list")));
                }
                Ok(())
            }
        }
    }

    /// Draw one value uniformly from the declared distribution.
    pub(crate) fn sample_uniform<R: Rng>(&self, rng: &mut R) -> ParamValue {
        match self {
            Self::Float {
                low,
                high,
                step,
                log,
            } => {
                let value = if *log {
                    // Sample uniformly in log space
                    let log_value = rng.random_range(low.ln()..=high.ln());
                    log_value.exp().clamp(*low, *high)
                } else if let Some(s) = step {
                    let n_steps = ((high - low) / s).floor() as i64;
                    let k = rng.random_range(0..=n_steps);
                    low + (k as f64) * s
                } else {
                    rng.random_range(*low..=*high)
                };
                ParamValue::Float(value)
            }
            Self::Int {
                low,
                high,
                step,
                log,
            } => {
                let value = if *log {
                    // Sample uniformly in log space, round, clamp back in
                    let log_value = rng.random_range((*low as f64).ln()..=(*high as f64).ln());
                    (log_value.exp().round() as i64).clamp(*low, *high)
                } else {
                    let n_steps = (high - low) / step;
                    let k = rng.random_range(0..=n_steps);
                    low + k * step
                };
                ParamValue::Int(value)
            }
            Self::Choice { values } => {
                let idx = rng.random_range(0..values.len());
                param_from_choice(&values[idx])
            }
        }
    }

    /// Snap a continuous proposal (in linear domain) back onto this range's
    /// lattice and bounds. Only meaningful for numeric kinds.
    pub(crate) fn snap(&self, x: f64) -> ParamValue {
        match self {
            Self::Float {
                low, high, step, ..
            } => {
                let value = match step {
                    Some(s) => {
                        let top = low + ((high - low) / s).floor() * s;
                        (low + ((x - low) / s).round() * s).clamp(*low, top)
                    }
                    None => x.clamp(*low, *high),
                };
                ParamValue::Float(value)
            }
            Self::Int {
                low, high, step, ..
            } => {
                let n_steps = (high - low) / step;
                let k = (((x - *low as f64) / *step as f64).round() as i64).clamp(0, n_steps);
                ParamValue::Int(low + k * step)
            }
            Self::Choice { .. } => unreachable!("snap is only defined for numeric ranges"),
        }
    }

    /// Map a value into `[0, 1]` relative to the declared domain (log-aware).
    /// Returns `None` for values foreign to this declaration.
    pub(crate) fn normalized(&self, value: &ParamValue) -> Option<f64> {
        match self {
            Self::Float {
                low, high, log, ..
            } => {
                let v = value.as_f64()?;
                Some(unit_position(v, *low, *high, *log))
            }
            Self::Int {
                low, high, log, ..
            } => {
                let v = value.as_f64()?;
                Some(unit_position(v, *low as f64, *high as f64, *log))
            }
            Self::Choice { values } => {
                let idx = self.choice_index(value)?;
                if values.len() <= 1 {
                    Some(0.5)
                } else {
                    Some(idx as f64 / (values.len() - 1) as f64)
                }
            }
        }
    }

    /// Index of a sampled value within the declared choice list.
    pub(crate) fn choice_index(&self, value: &ParamValue) -> Option<usize> {
        match self {
            Self::Choice { values } => values
                .iter()
                .position(|candidate| param_from_choice(candidate) == *value),
            _ => None,
        }
    }
}

fn unit_position(v: f64, low: f64, high: f64, log: bool) -> f64 {
    if high <= low {
        return 0.5;
    }
    let t = if log {
        (v.ln() - low.ln()) / (high.ln() - low.ln())
    } else {
        (v - low) / (high - low)
    };
    t.clamp(0.0, 1.0)
}

/// Convert a declared choice into the canonical [`ParamValue`] shape:
/// numeric choices sample as `Int`/`Float`, everything else stays JSON.
pub(crate) fn param_from_choice(value: &serde_json::Value) -> ParamValue {
    if let Some(i) = value.as_i64() {
        ParamValue::Int(i)
    } else if let Some(f) = value.as_f64() {
        ParamValue::Float(f)
    } else {
        ParamValue::Json(value.clone())
    }
}

/// The full search space: an ordered list of parameter definitions with
/// unique names. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    parameters: Vec<ParameterDef>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Float {
                low,
                high,
                step: None,
                log: false,
            },
        });
        self
    }

    pub fn add_float_step(mut self, name: impl Into<String>, low: f64, high: f64, step: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Float {
                low,
                high,
                step: Some(step),
                log: false,
            },
        });
        self
    }

    pub fn add_log_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Float {
                low,
                high,
                step: None,
                log: true,
            },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.add_int_step(name, low, high, 1)
    }

    pub fn add_int_step(mut self, name: impl Into<String>, low: i64, high: i64, step: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Int {
                low,
                high,
                step,
                log: false,
            },
        });
        self
    }

    pub fn add_log_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Int {
                low,
                high,
                step: 1,
                log: true,
            },
        });
        self
    }

    pub fn add_choice(mut self, name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::Choice { values },
        });
        self
    }

    pub fn parameters(&self) -> &[ParameterDef] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterKind> {
        self.parameters
            .iter()
            .find(|def| def.name == name)
            .map(|def| &def.kind)
    }

    /// Check every declaration and name uniqueness. Called by
    /// [`StudyBuilder::build`](crate::StudyBuilder::build) so a malformed
    /// space never starts a study.
    pub fn validate(&self) -> PfResult<()> {
        let mut seen = std::collections::HashSet::new();
        for def in &self.parameters {
            if !seen.insert(def.name.as_str()) {
                return Err(spec_err(format!("duplicate parameter '{}'", def.name)));
            }
            def.kind.validate(&def.name)?;
        }
        Ok(())
    }

    /// Normalize a raw JSON parameter grid into a validated space.
    ///
    /// Each entry is either a plain array (categorical) or a range object
    /// with `low`/`high` and an optional `kind` (the legacy key `type` is
    /// accepted), `step` and `log`. An unknown `kind` downgrades to a plain
    /// float range over the declared bounds with a non-fatal warning.
    pub fn from_spec(raw: &serde_json::Value) -> PfResult<Self> {
        let map = raw
            .as_object()
            .ok_or_else(|| spec_err("parameter spec must be a JSON object"))?;

        let mut space = Self::new();
        for (name, decl) in map {
            let kind = match decl {
                serde_json::Value::Array(values) => ParameterKind::Choice {
                    values: values.clone(),
                },
                serde_json::Value::Object(fields) => parse_range(name, fields)?,
                other => {
                    return Err(spec_err(format!(
                        "'{name}': expected array or range object, got {other}"
                    )))
                }
            };
            space.parameters.push(ParameterDef {
                name: name.clone(),
                kind,
            });
        }

        space.validate()?;
        Ok(space)
    }

    /// Canonical raw-spec form of this space; `from_spec(&to_spec())` is the
    /// identity on validated spaces.
    pub fn to_spec(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for def in &self.parameters {
            let entry = match &def.kind {
                ParameterKind::Float {
                    low,
                    high,
                    step,
                    log,
                } => {
                    let mut obj = serde_json::Map::new();
                    obj.insert("kind".into(), "float".into());
                    obj.insert("low".into(), serde_json::json!(low));
                    obj.insert("high".into(), serde_json::json!(high));
                    if let Some(s) = step {
                        obj.insert("step".into(), serde_json::json!(s));
                    }
                    if *log {
                        obj.insert("log".into(), serde_json::json!(true));
                    }
                    serde_json::Value::Object(obj)
                }
                ParameterKind::Int {
                    low,
                    high,
                    step,
                    log,
                } => {
                    let mut obj = serde_json::Map::new();
                    obj.insert("kind".into(), "int".into());
                    obj.insert("low".into(), serde_json::json!(low));
                    obj.insert("high".into(), serde_json::json!(high));
                    if *step != 1 {
                        obj.insert("step".into(), serde_json::json!(step));
                    }
                    if *log {
                        obj.insert("log".into(), serde_json::json!(true));
                    }
                    serde_json::Value::Object(obj)
                }
                ParameterKind::Choice { values } => serde_json::Value::Array(values.clone()),
            };
            map.insert(def.name.clone(), entry);
        }
        serde_json::Value::Object(map)
    }
}

impl Default for ParameterSpace {
    fn default() -> Self {
        Self::new()
    }
}

fn spec_err(message: impl Into<String>) -> PfError {
    PfError::InvalidParameterSpec(message.into())
}

fn parse_range(
    name: &str,
    fields: &serde_json::Map<String, serde_json::Value>,
) -> PfResult<ParameterKind> {
    let kind = fields
        .get("kind")
        .or_else(|| fields.get("type"))
        .map(|v| {
            v.as_str()
                .map(str::to_owned)
                .ok_or_else(|| spec_err(format!("'{name}': kind must be a string")))
        })
        .transpose()?
        .unwrap_or_else(|| "float".to_string());

    let low = fields
        .get("low")
        .ok_or_else(|| spec_err(format!("'{name}': missing 'low'")))?;
    let high = fields
        .get("high")
        .ok_or_else(|| spec_err(format!("'{name}': missing 'high'")))?;
    let log = match fields.get("log") {
        None => false,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| spec_err(format!("'{name}': log must be a boolean")))?,
    };

    match kind.as_str() {
        "int" => {
            let step = match fields.get("step") {
                None => 1,
                Some(v) => int_field(name, "step", v)?,
            };
            Ok(ParameterKind::Int {
                low: int_field(name, "low", low)?,
                high: int_field(name, "high", high)?,
                step,
                log,
            })
        }
        "float" => {
            let step = fields
                .get("step")
                .map(|v| float_field(name, "step", v))
                .transpose()?;
            Ok(ParameterKind::Float {
                low: float_field(name, "low", low)?,
                high: float_field(name, "high", high)?,
                step,
                log,
            })
        }
        other => {
            // Unknown kinds keep working as plain float ranges over the
            // declared bounds; the warning makes typos visible.
            warn!(parameter = name, kind = other, "unknown parameter kind, treating as float");
            Ok(ParameterKind::Float {
                low: float_field(name, "low", low)?,
                high: float_field(name, "high", high)?,
                step: None,
                log: false,
            })
        }
    }
}

fn int_field(name: &str, field: &str, value: &serde_json::Value) -> PfResult<i64> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
            return Ok(f as i64);
        }
    }
    Err(spec_err(format!(
        "'{name}': {field} must be an integer, got {value}"
    )))
}

fn float_field(name: &str, field: &str, value: &serde_json::Value) -> PfResult<f64> {
    value
        .as_f64()
        .filter(|f| f.is_finite())
        .ok_or_else(|| spec_err(format!("'{name}': {field} must be a finite number, got {value}")))
}
