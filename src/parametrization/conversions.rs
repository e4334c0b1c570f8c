//! Unit conversions and rounding used when filling parameter tables.

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Rounds to the nearest multiple of `precision`, ties away from zero.
/// A `precision` of zero rounds to whole numbers. Non-finite input is
/// returned unchanged.
pub fn round_to_precision(number: f64, precision: f64) -> f64 {
    if !number.is_finite() {
        return number;
    }
    let precision = if precision == 0.0 { 1.0 } else { precision.abs() };
    // Strip representation noise such as 0.1 + 0.2 before deciding a tie.
    let quotient = number / precision;
    let quotient = (quotient * 1e9).round() / 1e9;
    let rounded = quotient.round() * precision;
    if precision < 1.0 {
        let decimals = (-precision.log10()).ceil() as usize;
        format!("{rounded:.decimals$}").parse().unwrap_or(rounded)
    } else {
        rounded
    }
}

/// Rounds to at most `digits` significant digits; zero stays zero.
pub fn round_to_significant_digits(number: f64, digits: u32) -> f64 {
    if number == 0.0 || !number.is_finite() || digits == 0 {
        return number;
    }
    let exponent = number.abs().log10().floor() as i32;
    let precision = 10f64.powi(exponent - digits as i32 + 1);
    round_to_precision(number, precision)
}

/// Flow rates are stored with three significant digits.
pub fn round_flow_rate(flow_rate: f64) -> f64 {
    round_to_significant_digits(flow_rate, 3)
}

/// Net rate over `area_m2` in m³/s, rounded to `precision`.
pub fn mm_per_day_to_m3_per_second(mm_per_day: f64, area_m2: f64, precision: f64) -> f64 {
    round_to_precision(mm_per_day * area_m2 * 1e-3 / SECONDS_PER_DAY, precision)
}

/// Rate in m/s for a depth rate in mm/day.
pub fn mm_per_day_to_m_per_second(mm_per_day: f64) -> f64 {
    mm_per_day * 1e-3 / SECONDS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_precision() {
        assert_eq!(round_to_precision(1234.0, 10.0), 1230.0);
        assert_eq!(round_to_precision(1235.0, 10.0), 1240.0);
        assert_eq!(round_to_precision(0.125, 0.01), 0.13);
        assert_eq!(round_to_precision(-0.125, 0.01), -0.13);
        assert_eq!(round_to_precision(2.5, 0.0), 3.0);
        assert!(round_to_precision(f64::NAN, 0.1).is_nan());
    }

    #[test]
    fn test_significant_digits() {
        assert_eq!(round_to_significant_digits(0.012345, 3), 0.0123);
        assert_eq!(round_to_significant_digits(123456.0, 3), 123000.0);
        assert_eq!(round_to_significant_digits(0.0, 3), 0.0);
        assert_eq!(round_flow_rate(1.23456), 1.23);
    }

    #[test]
    fn test_mm_per_day() {
        // 15 mm/day over 1 km² is 0.1736 m³/s
        assert_eq!(mm_per_day_to_m3_per_second(15.0, 1.0e6, 0.001), 0.174);
        assert!((mm_per_day_to_m_per_second(86.4) - 1e-6).abs() < 1e-15);
    }
}
