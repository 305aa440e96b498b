//! Raw-field to typed-value conversion.
//!
//! A reply line carries every keyword's fields as raw text; this module turns
//! one keyword's raw field list into a typed value tuple. Keeping conversion
//! out of the parser lets a single line update heterogeneous key variables
//! (ints, floats, bool tuples, free text) without per-keyword branching in
//! the dispatcher.
//!
//! Converters are applied positionally. If a single converter is given for a
//! multi-field keyword it is broadcast across every field; for variable-arity
//! keywords with several converters, the last converter covers the extra
//! fields.
//!
//! Hub conventions for "unknown": the tokens `?` and `NaN` (case-insensitive)
//! under an `*_or_none` converter become [`Field::None`] instead of failing.
//! Some controllers additionally report a numeric sentinel (commonly `-1`)
//! for "not known yet"; the `*_or_none` converters accept an invalid-value
//! list that maps such sentinels to [`Field::None`] as well.

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

// =============================================================================
// Field - one typed, nullable slot in a value tuple
// =============================================================================

/// One typed field of a key variable's value tuple.
///
/// Each slot is individually nullable: a tuple like `(2, "MK_J", None, 21.0)`
/// is a normal state for an instrument that has not reported every field yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Field {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// Unknown or missing value (`?`, `NaN`, or a configured sentinel).
    None,
}

impl Field {
    pub fn is_none(&self) -> bool {
        matches!(self, Field::None)
    }

    /// The value as `i64`, if this field holds an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Field::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as `f64`; integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Field::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            Field::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Field::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Field::Str(v) => Some(v),
            _ => None,
        }
    }
}

// =============================================================================
// Arity - expected field count for one keyword
// =============================================================================

/// Expected field count for one keyword: exact, or open-ended above a floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match self {
            Arity::Exactly(want) => n == *want,
            Arity::AtLeast(floor) => n >= *floor,
        }
    }

    /// Minimum field count; also the length of the all-null initial tuple.
    pub fn min(&self) -> usize {
        match self {
            Arity::Exactly(n) | Arity::AtLeast(n) => *n,
        }
    }
}

impl std::fmt::Display for Arity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "exactly {n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

// =============================================================================
// BoolTokens - configurable true/false/unknown vocabulary
// =============================================================================

/// Token vocabulary for boolean fields.
///
/// Defaults to the hub convention `T`/`F` with `?` for unknown. Instruments
/// with their own vocabulary (e.g. a filter slide reporting `In`/`Out`)
/// supply their tokens explicitly. Matching is ASCII case-insensitive.
#[derive(Debug, Clone)]
pub struct BoolTokens {
    truthy: Vec<String>,
    falsy: Vec<String>,
    unknown: Vec<String>,
}

impl Default for BoolTokens {
    fn default() -> Self {
        Self::new(&["T"], &["F"])
    }
}

impl BoolTokens {
    /// Build a vocabulary from true/false token lists; `?` stays the
    /// unknown token unless overridden with [`BoolTokens::with_unknown`].
    pub fn new(truthy: &[&str], falsy: &[&str]) -> Self {
        Self {
            truthy: truthy.iter().map(|s| (*s).to_string()).collect(),
            falsy: falsy.iter().map(|s| (*s).to_string()).collect(),
            unknown: vec!["?".to_string()],
        }
    }

    pub fn with_unknown(mut self, unknown: &[&str]) -> Self {
        self.unknown = unknown.iter().map(|s| (*s).to_string()).collect();
        self
    }

    fn classify(&self, raw: &str) -> Option<Field> {
        let matches = |set: &[String]| set.iter().any(|t| t.eq_ignore_ascii_case(raw));
        if matches(&self.truthy) {
            Some(Field::Bool(true))
        } else if matches(&self.falsy) {
            Some(Field::Bool(false))
        } else if matches(&self.unknown) {
            Some(Field::None)
        } else {
            None
        }
    }
}

// =============================================================================
// Converter - string -> typed field
// =============================================================================

/// A single string-to-typed-field conversion.
#[derive(Debug, Clone)]
pub enum Converter {
    /// Strict integer; fails on non-numeric text.
    Int,
    /// Integer, or `None` for `?`/`NaN`/empty or a listed sentinel value.
    IntOrNone { invalid: Vec<i64> },
    /// Strict float; fails on non-numeric text.
    Float,
    /// Float, or `None` for `?`/`NaN`/empty or a listed sentinel value.
    FloatOrNone { invalid: Vec<f64> },
    /// Boolean via a token vocabulary; unknown tokens become `None`.
    Bool(BoolTokens),
    /// Pass-through string, stripping one layer of matching quotes.
    Str,
}

impl Converter {
    pub fn int_or_none() -> Self {
        Converter::IntOrNone { invalid: Vec::new() }
    }

    /// Integer-or-none that also treats the listed sentinels as unknown.
    pub fn int_or_none_invalid(invalid: &[i64]) -> Self {
        Converter::IntOrNone {
            invalid: invalid.to_vec(),
        }
    }

    pub fn float_or_none() -> Self {
        Converter::FloatOrNone { invalid: Vec::new() }
    }

    /// Float-or-none that also treats the listed sentinels as unknown.
    pub fn float_or_none_invalid(invalid: &[f64]) -> Self {
        Converter::FloatOrNone {
            invalid: invalid.to_vec(),
        }
    }

    /// Boolean with the default `T`/`F` vocabulary.
    pub fn bool_default() -> Self {
        Converter::Bool(BoolTokens::default())
    }

    /// Convert one raw field. The error is a bare reason; callers wrap it
    /// with the keyword name.
    pub fn convert(&self, raw: &str) -> std::result::Result<Field, String> {
        let raw = strip_quotes(raw.trim());
        match self {
            Converter::Int => raw
                .parse::<i64>()
                .map(Field::Int)
                .map_err(|_| format!("'{raw}' is not an integer")),

            Converter::IntOrNone { invalid } => {
                if is_none_token(raw) {
                    return Ok(Field::None);
                }
                let v = raw
                    .parse::<i64>()
                    .map_err(|_| format!("'{raw}' is not an integer"))?;
                if invalid.contains(&v) {
                    Ok(Field::None)
                } else {
                    Ok(Field::Int(v))
                }
            }

            Converter::Float => raw
                .parse::<f64>()
                .map(Field::Float)
                .map_err(|_| format!("'{raw}' is not a number")),

            Converter::FloatOrNone { invalid } => {
                if is_none_token(raw) {
                    return Ok(Field::None);
                }
                let v = raw
                    .parse::<f64>()
                    .map_err(|_| format!("'{raw}' is not a number"))?;
                if v.is_nan() || invalid.iter().any(|bad| *bad == v) {
                    Ok(Field::None)
                } else {
                    Ok(Field::Float(v))
                }
            }

            Converter::Bool(tokens) => tokens
                .classify(raw)
                .ok_or_else(|| format!("'{raw}' is not a recognized boolean token")),

            Converter::Str => Ok(Field::Str(raw.to_string())),
        }
    }
}

fn is_none_token(raw: &str) -> bool {
    raw.is_empty() || raw == "?" || raw.eq_ignore_ascii_case("nan")
}

/// Strip one layer of matching `"` or `'` quotes, if present.
pub(crate) fn strip_quotes(raw: &str) -> &str {
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

/// Convert one keyword's raw field list into a typed tuple.
///
/// Validates the field count against `arity`, then applies `converters`
/// positionally (broadcasting a lone converter, repeating the last one for
/// variable-arity overflow). Any failure is a [`DispatchError::Conversion`]
/// for this keyword only.
pub fn convert_fields(
    keyword: &str,
    arity: Arity,
    converters: &[Converter],
    raw_fields: &[String],
) -> Result<Vec<Field>> {
    let conversion_err = |reason: String| DispatchError::Conversion {
        keyword: keyword.to_string(),
        reason,
    };

    if !arity.accepts(raw_fields.len()) {
        return Err(conversion_err(format!(
            "expected {} field(s), got {}",
            arity,
            raw_fields.len()
        )));
    }
    if converters.is_empty() {
        return Err(conversion_err("no converters configured".to_string()));
    }
    if converters.len() > 1 && raw_fields.len() < converters.len() {
        return Err(conversion_err(format!(
            "{} converters configured but only {} field(s) arrived",
            converters.len(),
            raw_fields.len()
        )));
    }

    raw_fields
        .iter()
        .enumerate()
        .map(|(i, raw)| {
            let conv = if converters.len() == 1 {
                &converters[0]
            } else {
                converters.get(i).unwrap_or_else(|| {
                    // Repeat the last converter for variable-arity overflow.
                    &converters[converters.len() - 1]
                })
            };
            conv.convert(raw)
                .map_err(|reason| conversion_err(format!("field {i}: {reason}")))
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
