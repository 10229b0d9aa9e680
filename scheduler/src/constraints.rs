//! Observing constraints
//!
//! The evaluator answers "can this job observe at time t" questions. It holds
//! no mutable state, so the greedy scheduler can call it for any instant
//! without side effects.

use crate::astro::{
    angular_separation, equatorial_to_horizontal, julian_day, moon_position, sun_position,
    EquatorialCoords,
};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::job::{Job, Target};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Geographic location of the observatory
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObserverLocation {
    /// Degrees, north positive
    pub latitude: f64,
    /// Degrees, east positive
    pub longitude: f64,
    /// Meters above sea level
    #[serde(default)]
    pub elevation: f64,
}

impl Default for ObserverLocation {
    fn default() -> Self {
        // Greenwich
        Self {
            latitude: 51.4769,
            longitude: 0.0,
            elevation: 46.0,
        }
    }
}

impl ObserverLocation {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: 0.0,
        }
    }

    fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwilightSettings {
    /// Sun altitude below which the sky counts as dark (degrees)
    #[serde(default = "default_sun_altitude_threshold")]
    pub sun_altitude_threshold: f64,

    /// Minutes cut from the start of the night
    #[serde(default)]
    pub dusk_offset_minutes: f64,

    /// Minutes cut from the end of the night
    #[serde(default)]
    pub dawn_offset_minutes: f64,
}

impl Default for TwilightSettings {
    fn default() -> Self {
        Self {
            sun_altitude_threshold: -18.0,
            dusk_offset_minutes: 0.0,
            dawn_offset_minutes: 0.0,
        }
    }
}

fn default_sun_altitude_threshold() -> f64 {
    -18.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizonPoint {
    pub azimuth: f64,
    pub altitude: f64,
}

/// Local horizon made of (azimuth, altitude) points
///
/// Altitudes between two points are interpolated linearly; the profile wraps
/// around at 360 degrees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtificialHorizon {
    #[serde(default)]
    pub points: Vec<HorizonPoint>,
}

impl ArtificialHorizon {
    pub fn new(points: Vec<HorizonPoint>) -> Self {
        Self { points }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        for point in &self.points {
            if !(0.0..360.0).contains(&point.azimuth) || !(-90.0..=90.0).contains(&point.altitude) {
                return Err(SchedulerError::InvalidConfig(format!(
                    "horizon point ({}, {}) is out of range",
                    point.azimuth, point.altitude
                )));
            }
        }
        Ok(())
    }

    /// Horizon altitude in a given direction, `None` without a profile
    pub fn altitude_at(&self, azimuth: f64) -> Option<f64> {
        let mut points = self.points.clone();
        points.sort_by(|a, b| a.azimuth.total_cmp(&b.azimuth));

        let first = *points.first()?;
        let last = *points.last()?;
        if points.len() == 1 {
            return Some(first.altitude);
        }

        let azimuth = azimuth.rem_euclid(360.0);
        let (prev, next) = match points.iter().position(|p| p.azimuth >= azimuth) {
            Some(0) | None => (last, first),
            Some(idx) => (points[idx - 1], points[idx]),
        };

        let span = (next.azimuth - prev.azimuth).rem_euclid(360.0);
        if span <= f64::EPSILON {
            return Some(prev.altitude);
        }
        let offset = (azimuth - prev.azimuth).rem_euclid(360.0);
        Some(prev.altitude + (next.altitude - prev.altitude) * offset / span)
    }
}

/// Altitude of a target at some instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AltitudeReading {
    pub degrees: f64,
    pub azimuth: f64,
    /// The target is west of the meridian
    pub is_setting: bool,
}

impl AltitudeReading {
    /// Reading for input that has no meaningful position
    pub fn invalid() -> Self {
        Self {
            degrees: f64::NAN,
            azimuth: f64::NAN,
            is_setting: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.degrees.is_finite() && self.azimuth.is_finite()
    }
}

/// Dark period around a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightWindow {
    pub dusk: DateTime<Utc>,
    pub dawn: DateTime<Utc>,
}

impl NightWindow {
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.dusk <= time && time < self.dawn
    }
}

#[derive(Debug, Clone)]
pub struct ConstraintEvaluator {
    location: ObserverLocation,
    twilight: TwilightSettings,
    horizon: ArtificialHorizon,
}

impl ConstraintEvaluator {
    pub fn new(location: ObserverLocation, twilight: TwilightSettings, horizon: ArtificialHorizon) -> Self {
        Self {
            location,
            twilight,
            horizon,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.location, config.twilight.clone(), config.horizon.clone())
    }

    pub fn location(&self) -> &ObserverLocation {
        &self.location
    }

    pub fn altitude(&self, target: &Target, time: DateTime<Utc>) -> AltitudeReading {
        let coords = target.coords();
        if !coords.is_finite() || !self.location.is_finite() {
            return AltitudeReading::invalid();
        }

        let jd = julian_day(&time);
        let horizontal = equatorial_to_horizontal(&coords, self.location.latitude, self.location.longitude, jd);

        AltitudeReading {
            degrees: horizontal.altitude,
            azimuth: horizontal.azimuth,
            is_setting: horizontal.hour_angle > 0.0,
        }
    }

    pub fn is_above_min_altitude(&self, job: &Job, time: DateTime<Utc>) -> bool {
        let Some(min_altitude) = job.constraints.min_altitude else {
            return true;
        };
        let reading = self.altitude(&job.target, time);
        reading.is_valid() && reading.degrees >= min_altitude
    }

    pub fn is_moon_separated(&self, job: &Job, time: DateTime<Utc>) -> bool {
        let Some(min_separation) = job.constraints.min_moon_separation else {
            return true;
        };
        let separation = self.moon_separation(&job.target, time);
        separation.is_finite() && separation >= min_separation
    }

    /// Whether `time` lies in the dark part of the night
    ///
    /// The night is bounded by the configured sun altitude and shortened by
    /// the dusk and dawn offsets.
    pub fn is_during_twilight(&self, time: DateTime<Utc>) -> bool {
        let threshold = self.twilight.sun_altitude_threshold;
        let after_dusk = time - minutes(self.twilight.dusk_offset_minutes);
        let before_dawn = time + minutes(self.twilight.dawn_offset_minutes);
        self.sun_altitude(after_dusk) <= threshold && self.sun_altitude(before_dawn) <= threshold
    }

    pub fn is_above_horizon_profile(&self, job: &Job, time: DateTime<Utc>) -> bool {
        if !job.constraints.enforce_horizon || self.horizon.is_empty() {
            return true;
        }
        let reading = self.altitude(&job.target, time);
        if !reading.is_valid() {
            return false;
        }
        match self.horizon.altitude_at(reading.azimuth) {
            Some(limit) => reading.degrees >= limit,
            None => true,
        }
    }

    /// All time dependent constraints of a job
    pub fn satisfies_all(&self, job: &Job, time: DateTime<Utc>) -> bool {
        self.is_above_min_altitude(job, time)
            && self.is_moon_separated(job, time)
            && (!job.constraints.enforce_twilight || self.is_during_twilight(time))
            && self.is_above_horizon_profile(job, time)
    }

    pub fn sun_altitude(&self, time: DateTime<Utc>) -> f64 {
        let jd = julian_day(&time);
        let sun = sun_position(jd);
        equatorial_to_horizontal(&sun, self.location.latitude, self.location.longitude, jd).altitude
    }

    /// Distance between a target and the moon, in degrees
    pub fn moon_separation(&self, target: &Target, time: DateTime<Utc>) -> f64 {
        let coords: EquatorialCoords = target.coords();
        if !coords.is_finite() {
            return f64::NAN;
        }
        let moon = moon_position(julian_day(&time));
        angular_separation(&coords, &moon)
    }

    /// The current night if it is dark, the next one otherwise
    ///
    /// Returns `None` when the sun does not go down far enough within the
    /// next day and a half.
    pub fn night_window(&self, now: DateTime<Utc>) -> Option<NightWindow> {
        const SCAN_STEP_MINUTES: i64 = 10;
        const SCAN_LIMIT_HOURS: i64 = 36;

        let is_dark = |t: DateTime<Utc>| self.is_during_twilight(t);
        let step = Duration::minutes(SCAN_STEP_MINUTES);
        let limit = Duration::hours(SCAN_LIMIT_HOURS);

        let dusk = if is_dark(now) {
            // Walk back to the start of this night
            let mut t = now;
            loop {
                let prev = t - step;
                if now - prev > limit {
                    break t;
                }
                if !is_dark(prev) {
                    break refine_transition(prev, t, |x| is_dark(x));
                }
                t = prev;
            }
        } else {
            scan_forward(now, now + limit, step, |x| is_dark(x))?
        };

        let dawn = scan_forward(dusk, dusk + limit, step, |x| !is_dark(x))?;
        Some(NightWindow { dusk, dawn })
    }
}

fn minutes(value: f64) -> Duration {
    Duration::seconds((value * 60.0).round() as i64)
}

/// First instant in `(from, until]` where `predicate` becomes true
///
/// Samples with `step`, then refines the transition to one second.
pub(crate) fn scan_forward<F>(
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    step: Duration,
    predicate: F,
) -> Option<DateTime<Utc>>
where
    F: Fn(DateTime<Utc>) -> bool,
{
    let mut prev = from;
    while prev < until {
        let next = std::cmp::min(prev + step, until);
        if predicate(next) {
            return Some(refine_transition(prev, next, &predicate));
        }
        prev = next;
    }
    None
}

/// Bisect between `low` (predicate false) and `high` (predicate true)
pub(crate) fn refine_transition<F>(mut low: DateTime<Utc>, mut high: DateTime<Utc>, predicate: F) -> DateTime<Utc>
where
    F: Fn(DateTime<Utc>) -> bool,
{
    while high - low > Duration::seconds(1) {
        let mid = low + (high - low) / 2;
        if predicate(mid) {
            high = mid;
        } else {
            low = mid;
        }
    }
    high
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConstraints;
    use chrono::TimeZone;

    fn evaluator() -> ConstraintEvaluator {
        ConstraintEvaluator::new(
            ObserverLocation::new(45.0, 0.0),
            TwilightSettings::default(),
            ArtificialHorizon::default(),
        )
    }

    fn job_with(target: Target, constraints: JobConstraints) -> Job {
        Job::new("T", target, "/seq/t.esq").with_constraints(constraints)
    }

    #[test]
    fn test_min_altitude_matches_reading_over_two_days() {
        let eval = evaluator();
        let job = job_with(
            Target::new(5.5, 10.0),
            JobConstraints {
                min_altitude: Some(15.0),
                ..Default::default()
            },
        );
        let center = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        for step in -96..=96 {
            let t = center + Duration::minutes(15 * step);
            let reading = eval.altitude(&job.target, t);
            assert_eq!(eval.is_above_min_altitude(&job, t), reading.degrees >= 15.0);
        }
    }

    #[test]
    fn test_is_setting_follows_altitude_trend() {
        let eval = evaluator();
        let target = Target::new(12.0, 20.0);
        let start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();

        for hour in 0..24 {
            let t = start + Duration::hours(hour);
            let now = eval.altitude(&target, t);
            let later = eval.altitude(&target, t + Duration::minutes(5));
            // Skip samples close to the meridian transits
            let jd = julian_day(&t);
            let lst = crate::astro::local_sidereal_time(jd, 0.0);
            let ha = crate::astro::normalize_hour_angle(lst - target.ra_hours);
            if ha.abs() < 0.2 || ha.abs() > 11.8 {
                continue;
            }
            assert_eq!(now.is_setting, later.degrees < now.degrees);
        }
    }

    #[test]
    fn test_invalid_coordinates_are_not_satisfiable() {
        let eval = evaluator();
        let job = job_with(
            Target::new(f64::NAN, 10.0),
            JobConstraints {
                min_altitude: Some(0.0),
                ..Default::default()
            },
        );
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        assert!(!eval.altitude(&job.target, now).is_valid());
        assert!(!eval.is_above_min_altitude(&job, now));
    }

    #[test]
    fn test_missing_constraints_are_satisfied() {
        let eval = evaluator();
        // Far southern target never rises at +45
        let job = job_with(Target::new(0.0, -80.0), JobConstraints::default());
        let noon = Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap();

        assert!(eval.altitude(&job.target, noon).degrees < 0.0);
        assert!(eval.is_above_min_altitude(&job, noon));
        assert!(eval.is_moon_separated(&job, noon));
        assert!(eval.is_above_horizon_profile(&job, noon));
        assert!(eval.satisfies_all(&job, noon));
    }

    #[test]
    fn test_twilight_at_midnight_and_noon() {
        let eval = evaluator();
        let midnight = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();

        assert!(eval.is_during_twilight(midnight));
        assert!(!eval.is_during_twilight(noon));
    }

    #[test]
    fn test_twilight_offsets_shrink_the_night() {
        let plain = evaluator();
        let window = plain
            .night_window(Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap())
            .unwrap();

        let shifted = ConstraintEvaluator::new(
            ObserverLocation::new(45.0, 0.0),
            TwilightSettings {
                dusk_offset_minutes: 30.0,
                ..Default::default()
            },
            ArtificialHorizon::default(),
        );
        let just_after_dusk = window.dusk + Duration::minutes(10);
        assert!(plain.is_during_twilight(just_after_dusk));
        assert!(!shifted.is_during_twilight(just_after_dusk));
    }

    #[test]
    fn test_night_window() {
        let eval = evaluator();
        let noon = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let window = eval.night_window(noon).unwrap();

        assert!(window.dusk > noon);
        assert!(window.dawn > window.dusk);
        assert!(window.dawn - window.dusk > Duration::hours(8));
        assert!(window.contains(window.dusk + (window.dawn - window.dusk) / 2));
        assert!(eval.sun_altitude(window.dusk) <= -18.0);
        assert!(eval.sun_altitude(window.dusk - Duration::seconds(2)) > -18.0);

        // Asking in the middle of the night returns the same night
        let midnight = window.dusk + Duration::hours(3);
        let same = eval.night_window(midnight).unwrap();
        assert!((same.dusk - window.dusk).num_seconds().abs() <= 2);
        assert!((same.dawn - window.dawn).num_seconds().abs() <= 2);
    }

    #[test]
    fn test_no_night_in_polar_summer() {
        let eval = ConstraintEvaluator::new(
            ObserverLocation::new(78.0, 15.0),
            TwilightSettings::default(),
            ArtificialHorizon::default(),
        );
        let summer = Utc.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        assert!(eval.night_window(summer).is_none());
    }

    #[test]
    fn test_moon_separation_constraint() {
        let eval = evaluator();
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let relaxed = job_with(
            Target::new(3.0, 20.0),
            JobConstraints {
                min_moon_separation: Some(0.0),
                ..Default::default()
            },
        );
        let impossible = job_with(
            Target::new(3.0, 20.0),
            JobConstraints {
                min_moon_separation: Some(181.0),
                ..Default::default()
            },
        );
        assert!(eval.is_moon_separated(&relaxed, now));
        assert!(!eval.is_moon_separated(&impossible, now));
    }

    #[test]
    fn test_horizon_interpolation_wraps() {
        let horizon = ArtificialHorizon::new(vec![
            HorizonPoint { azimuth: 90.0, altitude: 20.0 },
            HorizonPoint { azimuth: 350.0, altitude: 10.0 },
            HorizonPoint { azimuth: 10.0, altitude: 30.0 },
        ]);

        assert_eq!(horizon.altitude_at(10.0), Some(30.0));
        assert!((horizon.altitude_at(50.0).unwrap() - 25.0).abs() < 1e-9);
        // Between 350 and 10 across north
        assert!((horizon.altitude_at(0.0).unwrap() - 20.0).abs() < 1e-9);
        // Between 90 and 350
        assert!((horizon.altitude_at(220.0).unwrap() - 15.0).abs() < 1e-9);
        assert!(ArtificialHorizon::default().altitude_at(10.0).is_none());
    }

    #[test]
    fn test_horizon_profile_blocks_low_targets() {
        let eval = ConstraintEvaluator::new(
            ObserverLocation::new(45.0, 0.0),
            TwilightSettings::default(),
            ArtificialHorizon::new(vec![HorizonPoint { azimuth: 0.0, altitude: 89.0 }]),
        );
        let mut job = job_with(Target::new(2.0, 30.0), JobConstraints::default());
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();

        assert!(eval.is_above_horizon_profile(&job, now));
        job.constraints.enforce_horizon = true;
        assert!(!eval.is_above_horizon_profile(&job, now));
    }
}
