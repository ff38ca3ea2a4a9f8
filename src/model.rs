//! Model setup and per-year dispatch.
//!
//! Setup runs once, nationally: it validates the input, builds the technology
//! registry (including averaged heat pumps), computes national base-year
//! service shares per enduse and fits the adoption sigmoids for every switch.
//! The fitted state is read-only afterwards, so the (region, enduse) units of
//! a simulation year are dispatched to a worker pool with no ordering
//! constraint between them.

use crate::core::diffusion::{fit_sigmoid, FitPolicy, SigmoidParameters, MARKET_ENTRY_EPSILON};
use crate::core::enduse::{calculate_enduse, EnduseOutput, SwitchSetup};
use crate::core::load_profile::flatten_enduse_shape;
use crate::core::service::fuel_to_service;
use crate::core::switches::fuel_switch_anchors;
use crate::core::technology::TechnologyRegistry;
use crate::core::SimulationYears;
use crate::errors::DemandError;
use crate::input::{
    EnduseConfig, FuelMap, FuelType, ModelInput, ServiceSwitchInput, TechnologyShape,
};
use anyhow::bail;
use indexmap::IndexMap;
use rayon::prelude::*;

/// Results of all enduses of one region for one simulation year.
#[derive(Clone, Debug)]
pub struct RegionResults {
    pub region: String,
    pub enduses: IndexMap<String, EnduseOutput>,
}

#[derive(Clone, Debug)]
pub struct YearResults {
    pub year: u32,
    pub regions: Vec<RegionResults>,
}

pub struct Model {
    input: ModelInput,
    registry: TechnologyRegistry,
    tech_shapes: IndexMap<String, TechnologyShape>,
    switch_setups: IndexMap<String, SwitchSetup>,
}

impl Model {
    pub fn new(input: ModelInput) -> anyhow::Result<Self> {
        Self::with_fit_policy(input, &FitPolicy::default())
    }

    pub fn with_fit_policy(mut input: ModelInput, fit_policy: &FitPolicy) -> anyhow::Result<Self> {
        input.validate()?;

        let registry = TechnologyRegistry::from_inputs(
            &input.technologies,
            input.assumptions.heat_pump_split.as_ref(),
        )?;

        // fold any heat pump constituents into their averaged technology
        for config in input.enduses.values_mut() {
            remap_enduse_technologies(config, &registry);
        }
        let tech_shapes = remap_technology_shapes(&input, &registry);

        let service_shares_by = national_service_shares(&input, &registry)?;
        let switch_setups =
            fit_switch_sigmoids(&input, &registry, &service_shares_by, fit_policy)?;

        tracing::info!(
            enduses = input.enduses.len(),
            regions = input.regions.len(),
            "model setup complete"
        );

        Ok(Self {
            input,
            registry,
            tech_shapes,
            switch_setups,
        })
    }

    /// Calculate one simulation year. Every (region, enduse) unit is a pure
    /// function of read-only shared state, so regions run on a worker pool;
    /// a failing unit aborts the whole year without corrupting any sibling.
    pub fn run_year(&self, curr_yr: u32) -> anyhow::Result<YearResults> {
        let years = SimulationYears {
            base_yr: self.input.assumptions.base_yr,
            curr_yr,
            end_yr: self.input.assumptions.end_yr,
        };

        let regions = self
            .input
            .regions
            .par_iter()
            .map(|region| -> anyhow::Result<RegionResults> {
                let mut enduses = IndexMap::new();
                for (enduse, fuel_by) in &region.fuel_by_enduse {
                    let config = &self.input.enduses[enduse];
                    let output = calculate_enduse(
                        enduse,
                        fuel_by,
                        config,
                        &self.registry,
                        &self.tech_shapes,
                        &self.input.assumptions,
                        &region.climate,
                        region.scenario_drivers.get(enduse),
                        self.switch_setups
                            .get(enduse)
                            .unwrap_or(&SwitchSetup::None),
                        years,
                    )?;
                    enduses.insert(enduse.clone(), output);
                }
                Ok(RegionResults {
                    region: region.name.clone(),
                    enduses,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(YearResults {
            year: curr_yr,
            regions,
        })
    }

    pub fn registry(&self) -> &TechnologyRegistry {
        &self.registry
    }
}

/// Rewrite an enduse's technology share table through the heat pump
/// replacements, merging the constituents' fuel shares.
fn remap_enduse_technologies(config: &mut EnduseConfig, registry: &TechnologyRegistry) {
    config.tech_fueltype_shares = config
        .tech_fueltype_shares
        .iter()
        .map(|(&fuel_type, shares)| {
            let mut remapped: IndexMap<String, f64> = IndexMap::new();
            for (tech_name, &share) in shares {
                let resolved = registry.resolve_name(tech_name);
                *remapped.entry(resolved.to_string()).or_default() += share;
            }
            (fuel_type, remapped)
        })
        .collect();
}

/// Shape table with averaged heat pump shapes synthesized from their
/// constituents, weighted by the split fractions.
fn remap_technology_shapes(
    input: &ModelInput,
    registry: &TechnologyRegistry,
) -> IndexMap<String, TechnologyShape> {
    let mut shapes = input.tech_shapes.clone();

    let Some(split) = &input.assumptions.heat_pump_split else {
        return shapes;
    };

    let mut constituents: IndexMap<String, Vec<(String, f64)>> = IndexMap::new();
    for (name, &fraction) in split {
        let averaged = registry.resolve_name(name);
        if averaged != name {
            constituents
                .entry(averaged.to_string())
                .or_default()
                .push((name.clone(), fraction));
        }
    }

    for (averaged, parts) in constituents {
        let fraction_total: f64 = parts.iter().map(|(_, fraction)| fraction).sum();
        let mut shape_yh = Vec::new();
        let mut peak_dh: Option<Vec<f64>> = None;
        let mut all_have_peak = true;

        for (name, fraction) in &parts {
            let Some(shape) = input.tech_shapes.get(name) else {
                continue;
            };
            let weight = fraction / fraction_total;
            if shape_yh.is_empty() {
                shape_yh = vec![0.; shape.shape_yh.len()];
            }
            for (hour, &value) in shape.shape_yh.iter().enumerate() {
                shape_yh[hour] += value * weight;
            }
            match &shape.shape_peak_dh {
                Some(peak) => {
                    let accumulated = peak_dh.get_or_insert_with(|| vec![0.; peak.len()]);
                    for (hour, &value) in peak.iter().enumerate() {
                        accumulated[hour] += value * weight;
                    }
                }
                None => all_have_peak = false,
            }
        }

        shapes.insert(
            averaged,
            TechnologyShape {
                shape_yh,
                shape_peak_dh: if all_have_peak { peak_dh } else { None },
            },
        );
    }

    shapes
}

/// Base-year service breakdown per enduse from nationally aggregated fuel.
struct NationalServiceShares {
    share_tech: IndexMap<String, f64>,
    share_fueltype: IndexMap<FuelType, f64>,
}

fn national_service_shares(
    input: &ModelInput,
    registry: &TechnologyRegistry,
) -> anyhow::Result<IndexMap<String, NationalServiceShares>> {
    let base_years = SimulationYears {
        base_yr: input.assumptions.base_yr,
        curr_yr: input.assumptions.base_yr,
        end_yr: input.assumptions.end_yr,
    };

    let mut national_fuel: IndexMap<&String, FuelMap> = IndexMap::new();
    for region in &input.regions {
        for (enduse, fuel) in &region.fuel_by_enduse {
            let aggregate = national_fuel.entry(enduse).or_default();
            for (&fuel_type, &amount) in fuel {
                *aggregate.entry(fuel_type).or_default() += amount;
            }
        }
    }

    let mut shares = IndexMap::new();
    for (enduse, config) in &input.enduses {
        if config.tech_fueltype_shares.is_empty() {
            continue;
        }
        let Some(fuel) = national_fuel.get(enduse) else {
            continue;
        };
        let breakdown = fuel_to_service(
            fuel,
            &config.tech_fueltype_shares,
            &flatten_enduse_shape(&config.shape),
            registry,
            base_years,
        )?;
        shares.insert(
            enduse.clone(),
            NationalServiceShares {
                share_tech: breakdown.service_share_tech,
                share_fueltype: breakdown.service_share_fueltype,
            },
        );
    }

    Ok(shares)
}

/// Fit the adoption sigmoid of every switch and assemble the per-enduse
/// switch setup. Runs once, nationally, before any regional dispatch.
fn fit_switch_sigmoids(
    input: &ModelInput,
    registry: &TechnologyRegistry,
    service_shares_by: &IndexMap<String, NationalServiceShares>,
    fit_policy: &FitPolicy,
) -> anyhow::Result<IndexMap<String, SwitchSetup>> {
    let base_yr = input.assumptions.base_yr;
    let mut setups: IndexMap<String, SwitchSetup> = IndexMap::new();

    for switch in &input.service_switches {
        let technology = registry.resolve_name(&switch.technology).to_string();
        let setup = setups
            .entry(switch.enduse.clone())
            .or_insert_with(|| SwitchSetup::Service {
                targets_ey: IndexMap::new(),
                sigmoid_params: IndexMap::new(),
            });
        let SwitchSetup::Service {
            targets_ey,
            sigmoid_params,
        } = setup
        else {
            bail!(DemandError::Configuration(format!(
                "enduse '{}' mixes service switches with fuel switches",
                switch.enduse
            )));
        };
        targets_ey.insert(technology.clone(), switch.service_share_ey);

        if switch.service_share_ey > switch.service_share_by {
            let anchor_by = base_anchor(switch, registry, base_yr)?;
            let parameters = fit_adoption_sigmoid(
                &switch.enduse,
                &technology,
                [base_yr as f64, switch.switch_yr as f64],
                [anchor_by, switch.service_share_ey],
                switch.max_share,
                fit_policy,
            )?;
            sigmoid_params.insert(technology, parameters);
        }
    }

    for switch in &input.fuel_switches {
        let technology = registry.resolve_name(&switch.technology_install).to_string();
        let Some(shares) = service_shares_by.get(&switch.enduse) else {
            bail!(DemandError::Configuration(format!(
                "fuel switch defined for enduse '{}' which has no technology service shares",
                switch.enduse
            )));
        };
        let share_by_install = shares.share_tech.get(&technology).copied().unwrap_or_default();
        let fueltype_share = shares
            .share_fueltype
            .get(&switch.fueltype_replace)
            .copied()
            .unwrap_or_default();
        let anchors = fuel_switch_anchors(switch, share_by_install, fueltype_share);

        let anchor_by = if registry.get(&technology)?.market_entry > base_yr {
            MARKET_ENTRY_EPSILON
        } else {
            share_by_install.max(MARKET_ENTRY_EPSILON)
        };
        let parameters = fit_adoption_sigmoid(
            &switch.enduse,
            &technology,
            [base_yr as f64, anchors.switch_yr as f64],
            [anchor_by, anchors.target_share],
            anchors.l_parameter,
            fit_policy,
        )?;

        let setup = setups
            .entry(switch.enduse.clone())
            .or_insert_with(|| SwitchSetup::Fuel {
                switches: Vec::new(),
                sigmoid_params: IndexMap::new(),
            });
        let SwitchSetup::Fuel {
            switches,
            sigmoid_params,
        } = setup
        else {
            bail!(DemandError::Configuration(format!(
                "enduse '{}' mixes fuel switches with service switches",
                switch.enduse
            )));
        };
        switches.push(switch.clone());
        sigmoid_params.insert(technology, parameters);
    }

    Ok(setups)
}

fn base_anchor(
    switch: &ServiceSwitchInput,
    registry: &TechnologyRegistry,
    base_yr: u32,
) -> anyhow::Result<f64> {
    let technology = registry.get(registry.resolve_name(&switch.technology))?;
    Ok(if technology.market_entry > base_yr {
        MARKET_ENTRY_EPSILON
    } else {
        switch.service_share_by.max(MARKET_ENTRY_EPSILON)
    })
}

fn fit_adoption_sigmoid(
    enduse: &str,
    technology: &str,
    point_x: [f64; 2],
    point_y: [f64; 2],
    l_parameter: f64,
    fit_policy: &FitPolicy,
) -> anyhow::Result<SigmoidParameters> {
    fit_sigmoid(point_x, point_y, l_parameter, fit_policy).map_err(|error| {
        DemandError::NonConvergence {
            enduse: enduse.to_string(),
            technology: technology.to_string(),
            reason: error.to_string(),
        }
        .into()
    })
}
