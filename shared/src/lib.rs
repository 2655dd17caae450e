//! Types shared by the hazard server and its clients.
//!
//! Holds the point-of-interest model, the hazard category registry, the
//! great-circle distance used for every proximity decision, and the
//! line-oriented wire protocol spoken over TCP.

pub mod poi;
pub mod protocol;

pub use poi::{Poi, PoiType, UnknownPoiType};
pub use protocol::{ProtocolError, Request, Response};

/// Default TCP port of the hazard service
pub const DEFAULT_PORT: u16 = 6996;

/// Meters in one nautical mile
pub const METERS_PER_NAUTICAL_MILE: f64 = 1852.0;

/// One degree of arc is sixty nautical miles on the reference sphere
pub const METERS_PER_DEGREE: f64 = METERS_PER_NAUTICAL_MILE * 60.0;

/// Radius around a `GET_INFOS` position for which hazards are returned
pub const SERVICE_RADIUS_METERS: f64 = 20_000.0;

/// Great-circle distance in meters between two positions in decimal degrees.
///
/// Uses the haversine form, which stays accurate for the short distances the
/// deduplication radius works with.
pub fn distance_in_meters(latitude1: f64, longitude1: f64, latitude2: f64, longitude2: f64) -> f64 {
    let phi1 = latitude1.to_radians();
    let phi2 = latitude2.to_radians();
    let delta_phi = (latitude2 - latitude1).to_radians();
    let delta_lambda = (longitude2 - longitude1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let central_angle = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());

    central_angle.to_degrees() * METERS_PER_DEGREE
}
