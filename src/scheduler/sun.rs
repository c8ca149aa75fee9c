//! Sun event computation (dawn/sunrise/noon/sunset/dusk), reimplementing the
//! slice of `astral`'s solar position math that `domovoy` relies on
//! (`domovoy` constructs an `astral.LocationInfo` and calls `astral.sun.sun`).
//! No equivalent crate is carried by any example repo, so this is a direct
//! port of the standard NOAA solar position equations.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;

use crate::configuration::AstralLocation;
use crate::scheduler::trigger::SunEvent;

const CIVIL_TWILIGHT_DEG: f64 = 6.0;

/// Next occurrence (today, in `now`'s timezone) of `event`, or `None` if no
/// location is configured or the sun never reaches the requested altitude at
/// this latitude on this date (polar day/night).
pub fn next_sun_event(now: DateTime<Tz>, event: SunEvent, location: Option<&AstralLocation>) -> Option<DateTime<Tz>> {
    let location = location?;
    let tz = now.timezone();
    let date = now.date_naive();
    let noon_utc = solar_noon_utc(date, location.longitude);

    let result_utc = match event {
        SunEvent::Noon => Some(noon_utc),
        SunEvent::Sunrise => hour_angle_time(date, location, 0.833, true),
        SunEvent::Sunset => hour_angle_time(date, location, 0.833, false),
        SunEvent::Dawn => hour_angle_time(date, location, CIVIL_TWILIGHT_DEG, true),
        SunEvent::Dusk => hour_angle_time(date, location, CIVIL_TWILIGHT_DEG, false),
    }?;

    Some(tz.from_utc_datetime(&result_utc.naive_utc()))
}

fn solar_noon_utc(date: chrono::NaiveDate, longitude: f64) -> DateTime<Utc> {
    let day_of_year = date.ordinal() as f64;
    let eqtime = equation_of_time(day_of_year);
    let minutes_from_midnight_utc = 720.0 - 4.0 * longitude - eqtime;
    midnight_utc(date) + chrono::Duration::milliseconds((minutes_from_midnight_utc * 60_000.0) as i64)
}

fn midnight_utc(date: chrono::NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight always valid"))
}

/// Time (UTC) the sun crosses `zenith_offset_deg` below the horizon on
/// `date`; `rising` selects morning vs. evening crossing. `None` if the sun
/// never reaches that altitude (polar day/night).
fn hour_angle_time(date: chrono::NaiveDate, location: &AstralLocation, zenith_offset_deg: f64, rising: bool) -> Option<DateTime<Utc>> {
    let day_of_year = date.ordinal() as f64;
    let declination = solar_declination(day_of_year);
    let zenith = 90.0 + zenith_offset_deg;

    let lat_rad = location.latitude.to_radians();
    let decl_rad = declination.to_radians();
    let zenith_rad = zenith.to_radians();

    let cos_hour_angle = (zenith_rad.cos() - lat_rad.sin() * decl_rad.sin()) / (lat_rad.cos() * decl_rad.cos());
    if !(-1.0..=1.0).contains(&cos_hour_angle) {
        return None;
    }
    let hour_angle_deg = cos_hour_angle.acos().to_degrees();
    let eqtime = equation_of_time(day_of_year);

    let hour_angle_deg = if rising { -hour_angle_deg } else { hour_angle_deg };
    let minutes_from_midnight_utc = 720.0 - 4.0 * (location.longitude + hour_angle_deg) - eqtime;
    Some(midnight_utc(date) + chrono::Duration::milliseconds((minutes_from_midnight_utc * 60_000.0) as i64))
}

fn solar_declination(day_of_year: f64) -> f64 {
    23.45 * (((360.0 / 365.0) * (day_of_year - 81.0)).to_radians()).sin()
}

/// Minutes of difference between apparent and mean solar time (NOAA
/// approximation, sufficient for scheduling granularity).
fn equation_of_time(day_of_year: f64) -> f64 {
    let b = (360.0 / 365.0) * (day_of_year - 81.0);
    let b_rad = b.to_radians();
    9.87 * (2.0 * b_rad).sin() - 7.53 * b_rad.cos() - 1.5 * b_rad.sin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::UTC;

    fn lisbon() -> AstralLocation {
        AstralLocation {
            name: "Lisbon".to_string(),
            region: "Portugal".to_string(),
            timezone: "Europe/Lisbon".to_string(),
            latitude: 38.7223,
            longitude: -9.1393,
        }
    }

    #[test]
    fn sunrise_precedes_noon_precedes_sunset() {
        let now = UTC.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        let loc = lisbon();
        let sunrise = next_sun_event(now, SunEvent::Sunrise, Some(&loc)).unwrap();
        let noon = next_sun_event(now, SunEvent::Noon, Some(&loc)).unwrap();
        let sunset = next_sun_event(now, SunEvent::Sunset, Some(&loc)).unwrap();
        assert!(sunrise < noon);
        assert!(noon < sunset);
    }

    #[test]
    fn no_location_returns_none() {
        let now = UTC.with_ymd_and_hms(2024, 6, 21, 0, 0, 0).unwrap();
        assert!(next_sun_event(now, SunEvent::Noon, None).is_none());
    }
}
