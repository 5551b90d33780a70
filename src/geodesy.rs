//! Geodetic, ECEF and local NED frame conversions
//!
//! Positions are handled in `f64` until they are expressed relative to home;
//! ECEF coordinates are millions of meters and `f32` would lose decimeters.

use nalgebra::{Matrix3, Vector3};

use crate::types::HomeLocation;

/// WGS-84 semi-major axis in meters
const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 flattening
const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS-84 first eccentricity squared
const WGS84_E2: f64 = 2.0 * WGS84_F - WGS84_F * WGS84_F;

/// Convert geodetic coordinates to ECEF
///
/// # Arguments
/// * `latitude` - Latitude in degrees
/// * `longitude` - Longitude in degrees
/// * `altitude` - Height above the ellipsoid in meters
pub fn geodetic_to_ecef(latitude: f64, longitude: f64, altitude: f64) -> Vector3<f64> {
    let (sin_lat, cos_lat) = latitude.to_radians().sin_cos();
    let (sin_lon, cos_lon) = longitude.to_radians().sin_cos();

    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    Vector3::new(
        (n + altitude) * cos_lat * cos_lon,
        (n + altitude) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + altitude) * sin_lat,
    )
}

/// Rotation matrix taking ECEF vectors into the NED frame at the given origin
#[rustfmt::skip]
pub fn ecef_to_ned_rotation(latitude: f64, longitude: f64) -> Matrix3<f64> {
    let (sin_lat, cos_lat) = latitude.to_radians().sin_cos();
    let (sin_lon, cos_lon) = longitude.to_radians().sin_cos();

    Matrix3::new(
        -sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat,
        -sin_lon, cos_lon, 0.0,
        -cos_lat * cos_lon, -cos_lat * sin_lon, -sin_lat,
    )
}

/// Project an ECEF point into the local tangent plane of `origin`
///
/// `rne` is the ECEF to NED rotation at the origin; it is taken as given and
/// not re-derived, so a home location set by another subsystem is honored.
pub fn ecef_to_ned(ecef: &Vector3<f64>, origin: &Vector3<f64>, rne: &Matrix3<f64>) -> Vector3<f32> {
    let ned = rne * (ecef - origin);
    ned.cast::<f32>()
}

/// Geodetic coordinates straight into the NED frame anchored at `home`
///
/// # Example
/// ```
/// use nalgebra::Vector3;
/// use fusion_nav::HomeLocation;
/// use fusion_nav::geodesy::geodetic_to_ned;
///
/// let home = HomeLocation::from_geodetic(47.0, 8.0, 400.0, Vector3::new(1.0, 0.0, 0.0));
/// let ned = geodetic_to_ned(47.0, 8.0, 390.0, &home);
/// assert!((ned.z - 10.0).abs() < 1e-3);
/// ```
pub fn geodetic_to_ned(
    latitude: f64,
    longitude: f64,
    altitude: f64,
    home: &HomeLocation,
) -> Vector3<f32> {
    let ecef = geodetic_to_ecef(latitude, longitude, altitude);
    ecef_to_ned(&ecef, &home.ecef, &home.rne)
}
