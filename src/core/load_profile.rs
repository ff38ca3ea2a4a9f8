//! Disaggregation of yearly fuel onto a 365-day x 24-hour grid and detection
//! of the system peak.

use crate::core::technology::TechnologyRegistry;
use crate::core::units::{hourly_to_daily, DAYS_PER_YEAR, HOURS_PER_DAY, HOURS_PER_YEAR};
use crate::errors::DemandError;
use crate::input::{FuelMap, FuelType, LoadShape, TechnologyShape};
use anyhow::bail;
use indexmap::IndexMap;

/// Hourly fuel per fueltype: 8760 values each.
pub type HourlyFuel = IndexMap<FuelType, Vec<f64>>;
/// Daily fuel per fueltype: 365 values each.
pub type DailyFuel = IndexMap<FuelType, Vec<f64>>;
/// Hourly fuel of a single day per fueltype: 24 values each.
pub type PeakDayFuel = IndexMap<FuelType, Vec<f64>>;

/// Relative tolerance for energy conservation across resampling resolutions.
pub const CONSERVATION_REL_TOLERANCE: f64 = 1e-2;

/// Spread yearly fuel over the year with an enduse-level shape:
/// `fuel * shape_yd[day] * shape_dh[day][hour]`.
pub fn disaggregate_with_enduse_shape(fuel_y: &FuelMap, shape: &LoadShape) -> HourlyFuel {
    fuel_y
        .iter()
        .map(|(&fuel_type, &fuel)| {
            let mut hourly = Vec::with_capacity(HOURS_PER_YEAR);
            for (day, &day_fraction) in shape.shape_yd.iter().enumerate() {
                for &hour_fraction in &shape.shape_dh[day] {
                    hourly.push(fuel * day_fraction * hour_fraction);
                }
            }
            (fuel_type, hourly)
        })
        .collect()
}

/// Spread each technology's yearly fuel over the year with its own shape and
/// accumulate onto the fueltype it consumes.
pub fn disaggregate_with_technology_shapes(
    fuel_tech: &IndexMap<String, f64>,
    tech_shapes: &IndexMap<String, TechnologyShape>,
    registry: &TechnologyRegistry,
) -> anyhow::Result<HourlyFuel> {
    let mut hourly_fuel = HourlyFuel::new();

    for (tech_name, &fuel) in fuel_tech {
        let technology = registry.get(tech_name)?;
        let shape = tech_shapes.get(tech_name).ok_or_else(|| {
            DemandError::Configuration(format!("technology '{tech_name}' has no load shape"))
        })?;
        let profile = hourly_fuel
            .entry(technology.fuel_type)
            .or_insert_with(|| vec![0.; HOURS_PER_YEAR]);
        for (hour, &fraction) in shape.shape_yh.iter().enumerate() {
            profile[hour] += fuel * fraction;
        }
    }

    Ok(hourly_fuel)
}

/// Flatten an enduse shape into a single fraction-of-year value per hour.
pub fn flatten_enduse_shape(shape: &LoadShape) -> Vec<f64> {
    let mut shape_yh = Vec::with_capacity(HOURS_PER_YEAR);
    for (day, &day_fraction) in shape.shape_yd.iter().enumerate() {
        for &hour_fraction in &shape.shape_dh[day] {
            shape_yh.push(day_fraction * hour_fraction);
        }
    }
    shape_yh
}

pub fn daily_from_hourly(hourly_fuel: &HourlyFuel) -> DailyFuel {
    hourly_fuel
        .iter()
        .map(|(&fuel_type, hourly)| (fuel_type, hourly_to_daily(hourly)))
        .collect()
}

/// The day with the maximum fuel summed across all fueltypes. The first day
/// encountered wins ties.
pub fn get_peak_day(daily_fuel: &DailyFuel) -> usize {
    let mut peak_day = 0;
    let mut peak_total = f64::NEG_INFINITY;
    for day in 0..DAYS_PER_YEAR {
        let day_total: f64 = daily_fuel
            .values()
            .map(|daily| daily.get(day).copied().unwrap_or_default())
            .sum();
        if day_total > peak_total {
            peak_total = day_total;
            peak_day = day;
        }
    }
    peak_day
}

/// Hourly profile of the peak day for an enduse calculated without
/// technologies: an average day scaled by the peak-day factor, distributed
/// over hours with the peak shape (or, where none is supplied, the hourly
/// shape of the day with the largest yearly fraction).
pub fn enduse_peak_day_profile(fuel_y: &FuelMap, shape: &LoadShape) -> PeakDayFuel {
    let peak_shape: &[f64] = match &shape.shape_peak_dh {
        Some(peak) => peak,
        None => {
            let busiest_day = shape
                .shape_yd
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(day, _)| day)
                .unwrap_or_default();
            &shape.shape_dh[busiest_day]
        }
    };

    fuel_y
        .iter()
        .map(|(&fuel_type, &fuel)| {
            let fuel_peak_day = fuel / DAYS_PER_YEAR as f64 * shape.peak_day_factor;
            (
                fuel_type,
                peak_shape
                    .iter()
                    .map(|&fraction| fuel_peak_day * fraction)
                    .collect(),
            )
        })
        .collect()
}

/// Hourly profile of the selected peak day, rebuilt per technology.
///
/// Each technology contributes the fuel its ordinary yearly profile places on
/// the peak day, distributed over hours by its peak shape. Technologies
/// without a pre-computed peak shape (hybrids) fall back to the peak-day
/// slice of their ordinary profile.
pub fn technology_peak_day_profile(
    fuel_tech: &IndexMap<String, f64>,
    tech_shapes: &IndexMap<String, TechnologyShape>,
    registry: &TechnologyRegistry,
    peak_day: usize,
) -> anyhow::Result<PeakDayFuel> {
    let mut peak_fuel = PeakDayFuel::new();

    for (tech_name, &fuel) in fuel_tech {
        let technology = registry.get(tech_name)?;
        let shape = tech_shapes.get(tech_name).ok_or_else(|| {
            DemandError::Configuration(format!("technology '{tech_name}' has no load shape"))
        })?;
        let day_slice = &shape.shape_yh[peak_day * HOURS_PER_DAY..(peak_day + 1) * HOURS_PER_DAY];
        let day_total: f64 = day_slice.iter().map(|&fraction| fuel * fraction).sum();

        let profile = peak_fuel
            .entry(technology.fuel_type)
            .or_insert_with(|| vec![0.; HOURS_PER_DAY]);
        match &shape.shape_peak_dh {
            Some(peak_shape) => {
                for (hour, &fraction) in peak_shape.iter().enumerate() {
                    profile[hour] += day_total * fraction;
                }
            }
            None => {
                for (hour, &fraction) in day_slice.iter().enumerate() {
                    profile[hour] += fuel * fraction;
                }
            }
        }
    }

    Ok(peak_fuel)
}

/// Maximum hourly value within the peak day, per fueltype. Different
/// fueltypes may peak in different hours; the result is not a single coherent
/// hour across fueltypes.
pub fn get_peak_hour(peak_day_fuel: &PeakDayFuel) -> IndexMap<FuelType, f64> {
    peak_day_fuel
        .iter()
        .map(|(&fuel_type, hourly)| {
            (
                fuel_type,
                hourly.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            )
        })
        .collect()
}

/// Check conservation of energy across resolutions: for every fueltype the
/// daily and hourly arrays must both reproduce the yearly total.
pub fn assert_fuel_conserved(
    enduse: &str,
    fuel_y: &FuelMap,
    daily_fuel: &DailyFuel,
    hourly_fuel: &HourlyFuel,
) -> anyhow::Result<()> {
    for (fuel_type, &yearly) in fuel_y {
        let daily_total: f64 = daily_fuel
            .get(fuel_type)
            .map(|daily| daily.iter().sum())
            .unwrap_or_default();
        let hourly_total: f64 = hourly_fuel
            .get(fuel_type)
            .map(|hourly| hourly.iter().sum())
            .unwrap_or_default();

        for (resolution, total) in [("daily", daily_total), ("hourly", hourly_total)] {
            if !is_close!(
                total,
                yearly,
                rel_tol = CONSERVATION_REL_TOLERANCE,
                abs_tol = 1e-9
            ) {
                bail!(DemandError::Consistency(format!(
                    "enduse '{enduse}', fueltype '{fuel_type}': {resolution} fuel sums to {total} but yearly total is {yearly}"
                )));
            }
        }
    }
    Ok(())
}
