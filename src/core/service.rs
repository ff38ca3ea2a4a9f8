//! Service accounting: conversion between fuel (what is burned) and energy
//! service (what is delivered), via technology efficiencies.

use crate::core::technology::TechnologyRegistry;
use crate::core::SimulationYears;
use crate::errors::DemandError;
use crate::input::{FuelMap, FuelType};
use anyhow::bail;
use indexmap::IndexMap;

/// Tolerance below which a total is treated as zero rather than divided by.
const ZERO_SERVICE_TOLERANCE: f64 = 1e-12;

/// Result of converting an enduse's fuel into energy service.
#[derive(Clone, Debug)]
pub struct ServiceBreakdown {
    /// Total service over all technologies and hours.
    pub total_service: f64,
    /// Hourly service per technology (8760 values each).
    pub service_tech: IndexMap<String, Vec<f64>>,
    /// Each technology's share of the enduse's total service.
    pub service_share_tech: IndexMap<String, f64>,
    /// Each fueltype's share of the enduse's total service.
    pub service_share_fueltype: IndexMap<FuelType, f64>,
}

/// Convert a yearly fuel array into energy service.
///
/// For each fueltype the fuel is split over the technologies defined for it,
/// spread over the year with `shape_yh` and multiplied by each technology's
/// efficiency in the current year. The per-technology sum is cross-checked
/// against the directly computed total.
pub fn fuel_to_service(
    fuel_y: &FuelMap,
    tech_fueltype_shares: &IndexMap<FuelType, IndexMap<String, f64>>,
    shape_yh: &[f64],
    registry: &TechnologyRegistry,
    years: SimulationYears,
) -> anyhow::Result<ServiceBreakdown> {
    let mut service_tech: IndexMap<String, Vec<f64>> = IndexMap::new();
    let mut service_total_tech: IndexMap<String, f64> = IndexMap::new();
    let mut service_total_fueltype: IndexMap<FuelType, f64> = IndexMap::new();
    let mut direct_total = 0.;

    for (&fuel_type, shares) in tech_fueltype_shares {
        let fuel_for_fueltype = fuel_y.get(&fuel_type).copied().unwrap_or_default();
        for (tech_name, &fuel_share) in shares {
            let technology = registry.get(tech_name)?;
            let efficiency =
                technology.efficiency(years.base_yr, years.curr_yr, years.end_yr);
            let fuel_slice = fuel_for_fueltype * fuel_share;

            let hourly_service: Vec<f64> = shape_yh
                .iter()
                .map(|&fraction| fuel_slice * fraction * efficiency)
                .collect();
            let tech_total: f64 = hourly_service.iter().sum();

            direct_total += fuel_slice * efficiency;
            *service_total_tech.entry(tech_name.clone()).or_default() += tech_total;
            *service_total_fueltype.entry(fuel_type).or_default() += tech_total;
            service_tech
                .entry(tech_name.clone())
                .and_modify(|existing| {
                    for (hour, value) in existing.iter_mut().zip(&hourly_service) {
                        *hour += value;
                    }
                })
                .or_insert(hourly_service);
        }
    }

    let total_service: f64 = service_total_tech.values().sum();
    if !is_close!(total_service, direct_total, rel_tol = 1e-9, abs_tol = 1e-9) {
        bail!(DemandError::Consistency(format!(
            "per-technology service sum {total_service} diverges from directly computed total {direct_total}"
        )));
    }

    let share_of_total = |value: f64| {
        if total_service.abs() < ZERO_SERVICE_TOLERANCE {
            0.
        } else {
            value / total_service
        }
    };
    let service_share_tech = service_total_tech
        .iter()
        .map(|(name, &service)| (name.clone(), share_of_total(service)))
        .collect();
    let service_share_fueltype = service_total_fueltype
        .iter()
        .map(|(&fuel_type, &service)| (fuel_type, share_of_total(service)))
        .collect();

    Ok(ServiceBreakdown {
        total_service,
        service_tech,
        service_share_tech,
        service_share_fueltype,
    })
}

/// Convert yearly service per technology back into fuel, using each
/// technology's current-year efficiency and accumulating onto the fueltype it
/// consumes.
///
/// A technology carrying service with a non-positive efficiency is a caller
/// contract violation and aborts the calculation.
pub fn service_to_fuel(
    service_by_tech: &IndexMap<String, f64>,
    registry: &TechnologyRegistry,
    years: SimulationYears,
) -> anyhow::Result<(FuelMap, IndexMap<String, f64>)> {
    let mut fuel_y = FuelMap::new();
    let mut fuel_tech = IndexMap::new();

    for (tech_name, &service) in service_by_tech {
        let technology = registry.get(tech_name)?;
        let efficiency = technology.efficiency(years.base_yr, years.curr_yr, years.end_yr);

        let fuel = if efficiency <= 0. {
            if service.abs() > ZERO_SERVICE_TOLERANCE {
                bail!(DemandError::Consistency(format!(
                    "technology '{tech_name}' carries service {service} but has non-positive efficiency {efficiency}"
                )));
            }
            0.
        } else {
            service / efficiency
        };

        *fuel_y.entry(technology.fuel_type).or_default() += fuel;
        fuel_tech.insert(tech_name.clone(), fuel);
    }

    Ok((fuel_y, fuel_tech))
}
