//! Core domain types for the sensor catalog.
//! Pure value types: no storage or wire-format dependencies.

// `ObservationType::from_str` returns None for unknown values rather than an error.
#![allow(clippy::should_implement_trait)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Descriptor ───────────────────────────────────────────────

/// Identifier, name and description shared by every catalog entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Descriptor {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Descriptor {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            description: None,
        }
    }
}

// ── Entities ─────────────────────────────────────────────────

/// A registered sensor or sensor system.
///
/// Children are not stored here; they are derived from the parent links of
/// other procedures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Procedure {
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl Procedure {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            descriptor: Descriptor::new(identifier),
            parent: None,
            disabled: false,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.descriptor.identifier
    }
}

/// A measured quantity kind. Composite when it has child properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservableProperty {
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Ordered child property identifiers; empty for simple phenomena.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl ObservableProperty {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            descriptor: Descriptor::new(identifier),
            children: Vec::new(),
        }
    }

    pub fn composite<I, S>(identifier: impl Into<String>, children: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            descriptor: Descriptor::new(identifier),
            children: children.into_iter().map(Into::into).collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.identifier
    }

    pub fn is_composite(&self) -> bool {
        !self.children.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offering {
    #[serde(flatten)]
    pub descriptor: Descriptor,
}

impl Offering {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            descriptor: Descriptor::new(identifier),
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.identifier
    }
}

/// Feature of interest. Geometry is opaque to the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    #[serde(flatten)]
    pub descriptor: Descriptor,
    pub feature_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<String>,
}

impl Feature {
    pub const SAMPLING_POINT: &'static str =
        "http://www.opengis.net/def/samplingFeatureType/OGC-OM/2.0/SF_SamplingPoint";

    pub fn new(identifier: impl Into<String>, feature_type: impl Into<String>) -> Self {
        Self {
            descriptor: Descriptor::new(identifier),
            feature_type: feature_type.into(),
            geometry: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.descriptor.identifier
    }
}

// ── Observation types ────────────────────────────────────────

/// Observation type of a constellation. `NotDefined` is the sentinel for
/// "registered but no type asserted yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationType {
    Measurement,
    Category,
    Count,
    Truth,
    Text,
    Geometry,
    Complex,
    SweArrayObservation,
    NotDefined,
}

const OM_TYPE_PREFIX: &str = "http://www.opengis.net/def/observationType/OGC-OM/2.0/";

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Measurement => "measurement",
            Self::Category => "category",
            Self::Count => "count",
            Self::Truth => "truth",
            Self::Text => "text",
            Self::Geometry => "geometry",
            Self::Complex => "complex",
            Self::SweArrayObservation => "swe_array_observation",
            Self::NotDefined => "not_defined",
        }
    }

    /// OGC O&M 2.0 observation type URI.
    pub fn uri(&self) -> String {
        let local = match self {
            Self::Measurement => "OM_Measurement",
            Self::Category => "OM_CategoryObservation",
            Self::Count => "OM_CountObservation",
            Self::Truth => "OM_TruthObservation",
            Self::Text => "OM_TextObservation",
            Self::Geometry => "OM_GeometryObservation",
            Self::Complex => "OM_ComplexObservation",
            Self::SweArrayObservation => "OM_SWEArrayObservation",
            Self::NotDefined => "NOT_DEFINED",
        };
        format!("{OM_TYPE_PREFIX}{local}")
    }

    /// Accepts the short snake-case name or the O&M 2.0 URI.
    pub fn from_str(s: &str) -> Option<Self> {
        let local = s.strip_prefix(OM_TYPE_PREFIX).unwrap_or(s);
        match local {
            "measurement" | "OM_Measurement" => Some(Self::Measurement),
            "category" | "OM_CategoryObservation" => Some(Self::Category),
            "count" | "OM_CountObservation" => Some(Self::Count),
            "truth" | "OM_TruthObservation" => Some(Self::Truth),
            "text" | "OM_TextObservation" => Some(Self::Text),
            "geometry" | "OM_GeometryObservation" => Some(Self::Geometry),
            "complex" | "OM_ComplexObservation" => Some(Self::Complex),
            "swe_array_observation" | "OM_SWEArrayObservation" => {
                Some(Self::SweArrayObservation)
            }
            "not_defined" | "NOT_DEFINED" => Some(Self::NotDefined),
            _ => None,
        }
    }

    pub fn is_concrete(&self) -> bool {
        !matches!(self, Self::NotDefined)
    }
}

impl fmt::Display for ObservationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Constellations ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstellationId(pub Uuid);

impl ConstellationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConstellationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConstellationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstellationKey {
    pub procedure: String,
    pub observable_property: String,
    pub offering: String,
}

impl ConstellationKey {
    pub fn new(
        procedure: impl Into<String>,
        observable_property: impl Into<String>,
        offering: impl Into<String>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            observable_property: observable_property.into(),
            offering: offering.into(),
        }
    }
}

/// Registered (procedure, property, offering) combination and its fixed type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationConstellation {
    pub id: ConstellationId,
    pub procedure: String,
    pub observable_property: String,
    pub offering: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation_type: Option<ObservationType>,
    #[serde(default)]
    pub hidden_child: bool,
    #[serde(default)]
    pub disabled: bool,
}

impl ObservationConstellation {
    pub fn new(key: ConstellationKey, hidden_child: bool) -> Self {
        Self {
            id: ConstellationId::new(),
            procedure: key.procedure,
            observable_property: key.observable_property,
            offering: key.offering,
            observation_type: None,
            hidden_child,
            disabled: false,
        }
    }

    pub fn key(&self) -> ConstellationKey {
        ConstellationKey::new(&self.procedure, &self.observable_property, &self.offering)
    }

    /// The stored type, if it is anything other than unset or the sentinel.
    pub fn concrete_type(&self) -> Option<ObservationType> {
        self.observation_type.filter(ObservationType::is_concrete)
    }

    /// Wildcard match: `None` matches anything.
    pub fn matches(
        &self,
        procedure: Option<&str>,
        observable_property: Option<&str>,
        offering: Option<&str>,
    ) -> bool {
        procedure.is_none_or(|p| p == self.procedure)
            && observable_property.is_none_or(|p| p == self.observable_property)
            && offering.is_none_or(|o| o == self.offering)
    }
}

// ── Time ─────────────────────────────────────────────────────

/// Closed time interval. An instant is a period with `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimePeriod {
    /// Bounds are ordered so that `start <= end` always holds.
    pub fn new(a: DateTime<Utc>, b: DateTime<Utc>) -> Self {
        Self {
            start: a.min(b),
            end: a.max(b),
        }
    }

    pub fn instant(t: DateTime<Utc>) -> Self {
        Self { start: t, end: t }
    }

    /// Widen to cover `other`: start = min, end = max.
    pub fn merge(&self, other: &TimePeriod) -> TimePeriod {
        TimePeriod {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservedTime {
    Instant(DateTime<Utc>),
    Period(TimePeriod),
}

impl ObservedTime {
    pub fn as_period(&self) -> TimePeriod {
        match self {
            Self::Instant(t) => TimePeriod::instant(*t),
            Self::Period(p) => *p,
        }
    }
}

/// Phenomenon and result time of a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTimes {
    pub phenomenon_time: ObservedTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_time: Option<ObservedTime>,
}

impl ObservedTimes {
    pub fn instant(t: DateTime<Utc>) -> Self {
        Self {
            phenomenon_time: ObservedTime::Instant(t),
            result_time: Some(ObservedTime::Instant(t)),
        }
    }

    pub fn period(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            phenomenon_time: ObservedTime::Period(TimePeriod::new(start, end)),
            result_time: Some(ObservedTime::Instant(end)),
        }
    }
}

/// A data series: one procedure observing one property at one feature,
/// published under one offering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub procedure: String,
    pub observable_property: String,
    pub feature: String,
    pub offering: String,
}

impl SeriesKey {
    pub fn new(
        procedure: impl Into<String>,
        observable_property: impl Into<String>,
        feature: impl Into<String>,
        offering: impl Into<String>,
    ) -> Self {
        Self {
            procedure: procedure.into(),
            observable_property: observable_property.into(),
            feature: feature.into(),
            offering: offering.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.procedure, self.observable_property, self.feature, self.offering
        )
    }
}
