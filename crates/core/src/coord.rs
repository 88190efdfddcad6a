//! Coordinate normalization: decimal degrees or a degrees/minutes/seconds
//! record with a compass direction, folded into signed decimal degrees.

use serde::{Deserialize, Serialize};

use crate::{GeoError, GeoResult};

/// A numeric DMS component. Numeric strings are accepted as well.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Component {
    Number(f64),
    Text(String),
}

impl Component {
    fn value(&self, field: &str) -> GeoResult<f64> {
        let v = match self {
            Component::Number(n) => *n,
            Component::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                GeoError::InvalidCoordinateFormat(format!("{field} is not a number: {s:?}"))
            })?,
        };
        if v.is_finite() {
            Ok(v)
        } else {
            Err(GeoError::InvalidCoordinateFormat(format!("{field} is not finite")))
        }
    }
}

impl From<f64> for Component {
    fn from(v: f64) -> Self {
        Component::Number(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dms {
    pub degrees: Component,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<Component>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<Component>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

impl Dms {
    pub fn new(degrees: f64, minutes: f64, seconds: f64, direction: &str) -> Self {
        Self {
            degrees: degrees.into(),
            minutes: Some(minutes.into()),
            seconds: Some(seconds.into()),
            direction: Some(direction.to_string()),
        }
    }

    pub fn to_decimal(&self) -> GeoResult<f64> {
        let degrees = self.degrees.value("degrees")?;
        let minutes = match &self.minutes {
            Some(m) => m.value("minutes")?,
            None => 0.0,
        };
        let seconds = match &self.seconds {
            Some(s) => s.value("seconds")?,
            None => 0.0,
        };
        let magnitude = degrees + minutes / 60.0 + seconds / 3600.0;
        let Some(direction) = self.direction.as_deref() else {
            return Err(GeoError::InvalidCoordinateFormat("direction is missing".into()));
        };
        match direction.trim().to_ascii_uppercase().as_str() {
            "N" | "E" => Ok(magnitude),
            "S" | "W" => Ok(-magnitude),
            other => Err(GeoError::InvalidCoordinateFormat(format!(
                "direction must be one of N, S, E, W; got {other:?}"
            ))),
        }
    }
}

/// A latitude or longitude as supplied by a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinate {
    Decimal(f64),
    Dms(Dms),
    /// Anything else; kept so that validation happens in `normalize`.
    Other(serde_json::Value),
}

impl Default for Coordinate {
    fn default() -> Self {
        Coordinate::Decimal(0.0)
    }
}

impl From<f64> for Coordinate {
    fn from(v: f64) -> Self {
        Coordinate::Decimal(v)
    }
}

impl From<Dms> for Coordinate {
    fn from(v: Dms) -> Self {
        Coordinate::Dms(v)
    }
}

/// Convert a coordinate into signed decimal degrees. Decimals pass through
/// unchanged; no range clamping happens here.
pub fn normalize(value: &Coordinate) -> GeoResult<f64> {
    match value {
        Coordinate::Decimal(v) => Ok(*v),
        Coordinate::Dms(dms) => dms.to_decimal(),
        Coordinate::Other(v) => Err(GeoError::InvalidCoordinateFormat(format!(
            "expected a decimal number or {{degrees, minutes, seconds, direction}}, got {v}"
        ))),
    }
}

/// Same as [`normalize`] for an untyped JSON value.
pub fn normalize_value(value: &serde_json::Value) -> GeoResult<f64> {
    let c: Coordinate = serde_json::from_value(value.clone())
        .map_err(|e| GeoError::InvalidCoordinateFormat(e.to_string()))?;
    normalize(&c)
}
