pub const HOURS_PER_DAY: usize = 24;
pub const DAYS_PER_YEAR: usize = 365;
pub const HOURS_PER_YEAR: usize = HOURS_PER_DAY * DAYS_PER_YEAR;

/// Years are shifted by this offset before being fed to the sigmoid fitter so
/// that the fitted midpoint stays in a small numeric range.
pub const SIGMOID_YEAR_OFFSET: f64 = 2000.;

/// Sum an hourly profile (8760 values) into daily totals (365 values).
pub(crate) fn hourly_to_daily(hourly: &[f64]) -> Vec<f64> {
    hourly
        .chunks(HOURS_PER_DAY)
        .map(|day| day.iter().sum())
        .collect()
}
