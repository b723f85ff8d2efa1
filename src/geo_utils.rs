//! Geographic utilities shared by the sample filter and the heatmap.

use crate::GpsPoint;

/// Mean Earth radius in meters used for all great-circle distances.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Great-circle distance between two points using the haversine formula.
///
/// The intermediate term is clamped to `[0, 1]` so antipodal points and
/// points straddling the antimeridian never produce NaN or negative results.
///
/// # Example
/// ```
/// use location_heatmap::GpsPoint;
/// use location_heatmap::geo_utils::haversine_distance;
///
/// let london = GpsPoint::new(51.5074, -0.1278);
/// let paris = GpsPoint::new(48.8566, 2.3522);
/// let d = haversine_distance(&london, &paris);
/// assert!((d - 343_500.0).abs() < 2_000.0);
/// ```
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let dlat = (p2.latitude - p1.latitude).to_radians();
    let dlng = (p2.longitude - p1.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Convert a distance in meters to degrees of longitude at a given latitude.
///
/// Near the poles the cosine is floored so the result stays finite.
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let cos_lat = latitude.to_radians().cos().abs().max(0.01);
    meters / (METERS_PER_DEGREE * cos_lat)
}

/// Approximate side length in meters of a rounding cell at `precision`
/// decimal places, measured along a meridian.
pub fn cell_size_meters(precision: u32) -> f64 {
    METERS_PER_DEGREE / 10f64.powi(precision as i32)
}
