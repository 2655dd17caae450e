//! Point-of-interest model and the hazard category registry.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Hazard categories a client can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoiType {
    FixedSpeedCam,
    MobileSpeedCam,
    Accident,
    Roadworks,
    Miscellaneous,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown poi type `{0}`")]
pub struct UnknownPoiType(pub String);

impl PoiType {
    pub const ALL: [PoiType; 5] = [
        PoiType::FixedSpeedCam,
        PoiType::MobileSpeedCam,
        PoiType::Accident,
        PoiType::Roadworks,
        PoiType::Miscellaneous,
    ];

    /// Name used on the wire and in the persistence file
    pub fn name(self) -> &'static str {
        match self {
            PoiType::FixedSpeedCam => "FIXED_SPEED_CAM",
            PoiType::MobileSpeedCam => "MOBILE_SPEED_CAM",
            PoiType::Accident => "ACCIDENT",
            PoiType::Roadworks => "ROADWORKS",
            PoiType::Miscellaneous => "MISCELLANEOUS",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            PoiType::FixedSpeedCam => "Fixed speed cam",
            PoiType::MobileSpeedCam => "Mobile speed cam",
            PoiType::Accident => "Accident",
            PoiType::Roadworks => "Roadworks",
            PoiType::Miscellaneous => "Miscellaneous",
        }
    }

    /// Builds a report of this category.
    pub fn construct(
        self,
        latitude: f64,
        longitude: f64,
        created_at: DateTime<Utc>,
        confirmations: u32,
    ) -> Poi {
        let mut poi = Poi::new(self, latitude, longitude, created_at);
        poi.confirmations = confirmations;
        poi
    }
}

impl fmt::Display for PoiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

impl FromStr for PoiType {
    type Err = UnknownPoiType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PoiType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| UnknownPoiType(s.to_string()))
    }
}

/// A geolocated hazard report.
///
/// Position, category and creation date identify the report and never change.
/// The vote counters and the removal stamp are only mutated by the store that
/// owns the report; everybody else works on clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    latitude: f64,
    longitude: f64,
    #[serde(rename = "type")]
    poi_type: PoiType,
    created_at: DateTime<Utc>,
    confirmations: u32,
    refutations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    removed_at: Option<DateTime<Utc>>,
}

impl Poi {
    /// Creates an unconfirmed report. The creation date is truncated to whole
    /// milliseconds, the resolution of the wire format.
    pub fn new(poi_type: PoiType, latitude: f64, longitude: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            poi_type,
            created_at: created_at.trunc_subsecs(3),
            confirmations: 0,
            refutations: 0,
            removed_at: None,
        }
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn poi_type(&self) -> PoiType {
        self.poi_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }

    pub fn refutations(&self) -> u32 {
        self.refutations
    }

    pub fn removed_at(&self) -> Option<DateTime<Utc>> {
        self.removed_at
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// True when both values describe the same report: identical position,
    /// category and creation date. Counters are not part of the identity.
    pub fn same_report(&self, other: &Poi) -> bool {
        self.latitude.to_bits() == other.latitude.to_bits()
            && self.longitude.to_bits() == other.longitude.to_bits()
            && self.poi_type == other.poi_type
            && self.created_at == other.created_at
    }

    /// Distance in meters from this report to a position
    pub fn distance_to(&self, latitude: f64, longitude: f64) -> f64 {
        crate::distance_in_meters(self.latitude, self.longitude, latitude, longitude)
    }

    /// Replaces both vote counters
    pub fn with_counters(mut self, confirmations: u32, refutations: u32) -> Self {
        self.confirmations = confirmations;
        self.refutations = refutations;
        self
    }

    /// Adds one confirmation and returns the new count
    pub fn confirm(&mut self) -> u32 {
        self.confirmations = self.confirmations.saturating_add(1);
        self.confirmations
    }

    /// Adds one refutation and returns the new count
    pub fn refute(&mut self) -> u32 {
        self.refutations = self.refutations.saturating_add(1);
        self.refutations
    }

    /// Stamps the removal date, never earlier than the creation date.
    pub fn mark_removed(&mut self, at: DateTime<Utc>) {
        self.removed_at = Some(at.trunc_subsecs(3).max(self.created_at));
    }
}

impl fmt::Display for Poi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at ({}, {}) reported {} [+{} / -{}]",
            self.poi_type.name(),
            self.latitude,
            self.longitude,
            self.created_at.to_rfc3339(),
            self.confirmations,
            self.refutations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 5, 3, 14, 22, 1).unwrap()
    }

    #[test]
    fn test_type_names_round_trip() {
        for poi_type in PoiType::ALL {
            assert_eq!(poi_type.name().parse::<PoiType>().unwrap(), poi_type);
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = "BOGUS_TYPE".parse::<PoiType>().unwrap_err();
        assert_eq!(err, UnknownPoiType("BOGUS_TYPE".to_string()));
        // Names are case sensitive
        assert!("accident".parse::<PoiType>().is_err());
    }

    #[test]
    fn test_construct_tags_each_variant() {
        for poi_type in PoiType::ALL {
            let poi = poi_type.construct(1.0, 2.0, sample_date(), 4);
            assert_eq!(poi.poi_type(), poi_type);
            assert_eq!(poi.confirmations(), 4);
            assert_eq!(poi.refutations(), 0);
            assert!(!poi.is_removed());
        }
    }

    #[test]
    fn test_creation_date_truncated_to_millis() {
        let date = sample_date() + Duration::nanoseconds(123_456_789);
        let poi = Poi::new(PoiType::Accident, 1.0, 2.0, date);
        assert_eq!(poi.created_at().timestamp_subsec_nanos(), 123_000_000);
    }

    #[test]
    fn test_same_report_ignores_counters() {
        let a = Poi::new(PoiType::Roadworks, 48.8, 2.3, sample_date());
        let b = a.clone().with_counters(7, 2);
        assert!(a.same_report(&b));
        assert_ne!(a, b);

        let moved = Poi::new(PoiType::Roadworks, 48.8, 2.30001, sample_date());
        assert!(!a.same_report(&moved));

        let retyped = Poi::new(PoiType::Accident, 48.8, 2.3, sample_date());
        assert!(!a.same_report(&retyped));

        let later = Poi::new(PoiType::Roadworks, 48.8, 2.3, sample_date() + Duration::seconds(1));
        assert!(!a.same_report(&later));
    }

    #[test]
    fn test_counters_increment() {
        let mut poi = Poi::new(PoiType::Accident, 0.0, 0.0, sample_date());
        assert_eq!(poi.confirm(), 1);
        assert_eq!(poi.confirm(), 2);
        assert_eq!(poi.refute(), 1);
        assert_eq!(poi.confirmations(), 2);
        assert_eq!(poi.refutations(), 1);
    }

    #[test]
    fn test_removed_date_never_precedes_creation() {
        let mut poi = Poi::new(PoiType::Accident, 0.0, 0.0, sample_date());
        poi.mark_removed(sample_date() - Duration::days(1));
        assert_eq!(poi.removed_at(), Some(sample_date()));

        let later = sample_date() + Duration::hours(2);
        poi.mark_removed(later);
        assert_eq!(poi.removed_at(), Some(later));
    }

    #[test]
    fn test_json_uses_wire_type_names() {
        let poi = Poi::new(PoiType::FixedSpeedCam, 1.5, 2.5, sample_date());
        let json = serde_json::to_string(&poi).unwrap();
        assert!(json.contains("\"type\":\"FIXED_SPEED_CAM\""));
        assert!(!json.contains("removed_at"));
    }
}
