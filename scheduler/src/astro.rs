//! Astronomical helper functions
//!
//! Low precision ephemerides that are good enough for scheduling decisions
//! (a fraction of a degree). Right ascensions are in hours, everything else
//! in degrees.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Julian day of the J2000.0 epoch
pub const J2000: f64 = 2451545.0;

/// Mean obliquity of the ecliptic used by the sun and moon approximations
const OBLIQUITY_DEG: f64 = 23.439;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EquatorialCoords {
    pub ra_hours: f64,
    pub dec_degrees: f64,
}

impl EquatorialCoords {
    pub fn new(ra_hours: f64, dec_degrees: f64) -> Self {
        Self { ra_hours, dec_degrees }
    }

    pub fn is_finite(&self) -> bool {
        self.ra_hours.is_finite() && self.dec_degrees.is_finite()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HorizontalCoords {
    pub altitude: f64,
    /// Azimuth measured from north through east, in [0, 360)
    pub azimuth: f64,
    /// Hour angle in hours, normalized to [-12, 12)
    pub hour_angle: f64,
}

/// Calculate Julian Day from a chrono DateTime
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let day = dt.day();

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + day as f64
        + b as f64
        - 1524.5;

    let seconds = dt.num_seconds_from_midnight() as f64 + dt.nanosecond() as f64 / 1e9;

    jd + seconds / 86400.0
}

/// Local sidereal time in hours for a julian day and an east-positive longitude
pub fn local_sidereal_time(jd: f64, longitude: f64) -> f64 {
    let t = (jd - J2000) / 36525.0;

    // Greenwich Mean Sidereal Time in degrees
    let gmst = 280.46061837 + 360.98564736629 * (jd - J2000) + 0.000387933 * t * t
        - t * t * t / 38710000.0;

    (gmst + longitude).rem_euclid(360.0) / 15.0
}

/// Wrap an hour angle into [-12, 12)
pub fn normalize_hour_angle(hours: f64) -> f64 {
    (hours + 12.0).rem_euclid(24.0) - 12.0
}

/// Convert equatorial coordinates to the local horizontal frame.
///
/// Uses `atan2` for the azimuth so that the zenith and the celestial poles
/// do not need special casing.
pub fn equatorial_to_horizontal(
    coords: &EquatorialCoords,
    latitude: f64,
    longitude: f64,
    jd: f64,
) -> HorizontalCoords {
    let lst = local_sidereal_time(jd, longitude);
    let hour_angle = normalize_hour_angle(lst - coords.ra_hours);

    let ha_rad = (hour_angle * 15.0).to_radians();
    let dec_rad = coords.dec_degrees.to_radians();
    let lat_rad = latitude.to_radians();

    let sin_alt = lat_rad.sin() * dec_rad.sin() + lat_rad.cos() * dec_rad.cos() * ha_rad.cos();
    let altitude = sin_alt.clamp(-1.0, 1.0).asin().to_degrees();

    let y = dec_rad.cos() * ha_rad.sin();
    let x = dec_rad.cos() * ha_rad.cos() * lat_rad.sin() - dec_rad.sin() * lat_rad.cos();
    let azimuth = (y.atan2(x).to_degrees() + 180.0).rem_euclid(360.0);

    HorizontalCoords {
        altitude,
        azimuth,
        hour_angle,
    }
}

/// Apparent position of the sun
pub fn sun_position(jd: f64) -> EquatorialCoords {
    // Days since J2000.0
    let n = jd - J2000;

    // Mean longitude and mean anomaly of the sun (degrees)
    let l = (280.460 + 0.9856474 * n).rem_euclid(360.0);
    let g = (357.528 + 0.9856003 * n).rem_euclid(360.0);
    let g_rad = g.to_radians();

    // Ecliptic longitude of the sun (degrees)
    let lambda = l + 1.915 * g_rad.sin() + 0.020 * (2.0 * g_rad).sin();
    let lambda_rad = lambda.to_radians();

    let epsilon_rad = (OBLIQUITY_DEG - 0.0000004 * n).to_radians();

    let ra = (epsilon_rad.cos() * lambda_rad.sin())
        .atan2(lambda_rad.cos())
        .to_degrees()
        .rem_euclid(360.0)
        / 15.0;
    let dec = (epsilon_rad.sin() * lambda_rad.sin()).asin().to_degrees();

    EquatorialCoords::new(ra, dec)
}

/// Approximate position of the moon
pub fn moon_position(jd: f64) -> EquatorialCoords {
    let days = jd - J2000;

    let moon_longitude = (218.32 + 13.176396 * days).rem_euclid(360.0);
    let moon_anomaly = (134.9 + 13.064993 * days).rem_euclid(360.0);
    let moon_node = (93.3 + 13.229350 * days).rem_euclid(360.0);

    // Approximate ecliptic latitude and longitude
    let ecl_lon = moon_longitude + 6.29 * moon_anomaly.to_radians().sin()
        - 1.27 * (2.0 * moon_node.to_radians() - moon_anomaly.to_radians()).sin();
    let ecl_lat = 5.13 * moon_node.to_radians().sin();

    let ecl_lon_rad = ecl_lon.to_radians();
    let ecl_lat_rad = ecl_lat.to_radians();
    let obl_rad = OBLIQUITY_DEG.to_radians();

    let ra = (ecl_lon_rad.sin() * obl_rad.cos() - ecl_lat_rad.tan() * obl_rad.sin())
        .atan2(ecl_lon_rad.cos())
        .to_degrees()
        .rem_euclid(360.0)
        / 15.0;
    let dec = (ecl_lat_rad.sin() * obl_rad.cos()
        + ecl_lat_rad.cos() * obl_rad.sin() * ecl_lon_rad.sin())
    .asin()
    .to_degrees();

    EquatorialCoords::new(ra, dec)
}

/// Angular distance between two positions, in degrees
pub fn angular_separation(a: &EquatorialCoords, b: &EquatorialCoords) -> f64 {
    let ra_a = (a.ra_hours * 15.0).to_radians();
    let ra_b = (b.ra_hours * 15.0).to_radians();
    let dec_a = a.dec_degrees.to_radians();
    let dec_b = b.dec_degrees.to_radians();

    let cos_sep = dec_a.sin() * dec_b.sin() + dec_a.cos() * dec_b.cos() * (ra_a - ra_b).cos();
    cos_sep.clamp(-1.0, 1.0).acos().to_degrees()
}
