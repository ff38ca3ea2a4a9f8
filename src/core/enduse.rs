//! The enduse calculation cascade.
//!
//! One call to [`calculate_enduse`] takes a region's base-year fuel for a
//! single enduse through the fixed stage sequence
//! (climate -> smart meter -> overall change -> scenario drivers ->
//! elasticity -> technology branch) and produces the final fuel arrays at
//! every resolution. Each stage is a pure transform returning a new fuel
//! array; the cascade is a fold over them in fixed order.

use crate::core::diffusion::{diffusion_fraction, SigmoidParameters};
use crate::core::load_profile::{
    assert_fuel_conserved, daily_from_hourly, disaggregate_with_enduse_shape,
    disaggregate_with_technology_shapes, enduse_peak_day_profile, flatten_enduse_shape,
    get_peak_day, get_peak_hour, technology_peak_day_profile, DailyFuel, HourlyFuel, PeakDayFuel,
};
use crate::core::service::{fuel_to_service, service_to_fuel};
use crate::core::switches::{apply_fuel_switch, apply_service_switch};
use crate::core::technology::TechnologyRegistry;
use crate::core::SimulationYears;
use crate::input::{
    ClimateFactors, ClimateSensitivity, DriverValues, EnduseConfig, FuelMap, FuelSwitchInput,
    FuelType, OverallChange, ScenarioAssumptions, SmartMeterAssumptions, TechnologyShape,
};
use indexmap::IndexMap;

/// Switch assumptions resolved for one enduse at model setup. Service and
/// fuel switches are mutually exclusive by construction (defining both is
/// rejected at input validation), so the cascade applies exactly one arm.
#[derive(Clone, Debug, Default)]
pub enum SwitchSetup {
    #[default]
    None,
    Service {
        targets_ey: IndexMap<String, f64>,
        sigmoid_params: IndexMap<String, SigmoidParameters>,
    },
    Fuel {
        switches: Vec<FuelSwitchInput>,
        sigmoid_params: IndexMap<String, SigmoidParameters>,
    },
}

/// Final fuel arrays of one (region, enduse, year) unit, per fueltype.
#[derive(Clone, Debug)]
pub struct EnduseOutput {
    pub fuel_y: FuelMap,
    pub fuel_yd: DailyFuel,
    pub fuel_yh: HourlyFuel,
    pub fuel_peak_dh: PeakDayFuel,
    pub fuel_peak_h: IndexMap<FuelType, f64>,
}

/// Scale fuel by the region's degree-day ratio when the enduse is climate
/// sensitive.
pub fn apply_climate_correction(
    fuel: &FuelMap,
    sensitivity: ClimateSensitivity,
    climate: &ClimateFactors,
) -> FuelMap {
    let factor = match sensitivity {
        ClimateSensitivity::None => 1.,
        ClimateSensitivity::Heating => climate.heating,
        ClimateSensitivity::Cooling => climate.cooling,
    };
    scale_fuel(fuel, factor)
}

/// Reduce fuel by the demand saved through smart meters installed since the
/// base year.
pub fn apply_smart_meter_savings(
    fuel: &FuelMap,
    saving: f64,
    smart_meter: &SmartMeterAssumptions,
    years: SimulationYears,
) -> FuelMap {
    let diffusion = diffusion_fraction(
        smart_meter.diffusion_method,
        years.base_yr,
        years.curr_yr,
        years.end_yr,
        smart_meter.sig_midpoint,
        smart_meter.sig_steepness,
    );
    let penetration_cy = smart_meter.penetration_by
        + (smart_meter.penetration_ey - smart_meter.penetration_by) * diffusion;
    scale_fuel(fuel, 1. - (penetration_cy - smart_meter.penetration_by) * saving)
}

/// Apply the generic overall demand change assumed for the enduse, diffused
/// between base and end year.
pub fn apply_overall_change(
    fuel: &FuelMap,
    change: &OverallChange,
    years: SimulationYears,
) -> FuelMap {
    let diffusion = diffusion_fraction(
        change.diffusion_method,
        years.base_yr,
        years.curr_yr,
        years.end_yr,
        change.sig_midpoint,
        change.sig_steepness,
    );
    scale_fuel(fuel, 1. + (change.factor_ey - 1.) * diffusion)
}

/// Scale fuel with the region's scenario driver (population, floor area,
/// GVA...). A near-zero base-year driver leaves the fuel unchanged.
pub fn apply_scenario_driver(fuel: &FuelMap, driver: Option<&DriverValues>) -> FuelMap {
    let factor = match driver {
        Some(driver) if driver.by.abs() > f64::EPSILON => driver.cy / driver.by,
        _ => 1.,
    };
    scale_fuel(fuel, factor)
}

/// Price-elasticity adjustment per fueltype. Fueltypes without a price in
/// either anchor year, or with a non-positive base price, pass through
/// unchanged.
pub fn apply_elasticity(
    fuel: &FuelMap,
    elasticity: f64,
    fuel_prices: &IndexMap<u32, FuelMap>,
    years: SimulationYears,
) -> FuelMap {
    fuel.iter()
        .map(|(&fuel_type, &amount)| {
            let price_by = fuel_prices
                .get(&years.base_yr)
                .and_then(|prices| prices.get(&fuel_type));
            let price_cy = fuel_prices
                .get(&years.curr_yr)
                .and_then(|prices| prices.get(&fuel_type));
            let factor = match (price_by, price_cy) {
                (Some(&by), Some(&cy)) if by > 0. && cy > 0. => (cy / by).powf(elasticity),
                _ => 1.,
            };
            (fuel_type, amount * factor)
        })
        .collect()
}

fn scale_fuel(fuel: &FuelMap, factor: f64) -> FuelMap {
    fuel.iter()
        .map(|(&fuel_type, &amount)| (fuel_type, amount * factor))
        .collect()
}

/// Run the whole cascade for one (region, enduse, year) unit.
pub fn calculate_enduse(
    enduse: &str,
    fuel_by: &FuelMap,
    config: &EnduseConfig,
    registry: &TechnologyRegistry,
    tech_shapes: &IndexMap<String, TechnologyShape>,
    assumptions: &ScenarioAssumptions,
    climate: &ClimateFactors,
    driver: Option<&DriverValues>,
    switch_setup: &SwitchSetup,
    years: SimulationYears,
) -> anyhow::Result<EnduseOutput> {
    // demand-side stages, in fixed order
    let stages: [&dyn Fn(FuelMap) -> FuelMap; 5] = [
        &|fuel| apply_climate_correction(&fuel, config.climate_sensitivity, climate),
        &|fuel| {
            apply_smart_meter_savings(
                &fuel,
                config.smart_meter_saving,
                &assumptions.smart_meter,
                years,
            )
        },
        &|fuel| apply_overall_change(&fuel, &config.overall_change, years),
        &|fuel| apply_scenario_driver(&fuel, driver),
        &|fuel| apply_elasticity(&fuel, config.elasticity, &assumptions.fuel_prices, years),
    ];
    let fuel = stages
        .iter()
        .fold(fuel_by.clone(), |fuel, stage| stage(fuel));
    tracing::debug!(
        enduse,
        total_fuel = fuel.values().sum::<f64>(),
        "demand-side stages applied"
    );

    if config.tech_fueltype_shares.is_empty() {
        calculate_without_technologies(enduse, &fuel, config)
    } else {
        calculate_with_technologies(
            enduse,
            &fuel,
            config,
            registry,
            tech_shapes,
            switch_setup,
            years,
        )
    }
}

/// Terminal branch for enduses without technologies: generic shapes and the
/// generic peak-day factor.
fn calculate_without_technologies(
    enduse: &str,
    fuel: &FuelMap,
    config: &EnduseConfig,
) -> anyhow::Result<EnduseOutput> {
    let fuel_yh = disaggregate_with_enduse_shape(fuel, &config.shape);
    let fuel_yd = daily_from_hourly(&fuel_yh);
    let fuel_peak_dh = enduse_peak_day_profile(fuel, &config.shape);
    let fuel_peak_h = get_peak_hour(&fuel_peak_dh);

    assert_fuel_conserved(enduse, fuel, &fuel_yd, &fuel_yh)?;

    Ok(EnduseOutput {
        fuel_y: fuel.clone(),
        fuel_yd,
        fuel_yh,
        fuel_peak_dh,
        fuel_peak_h,
    })
}

/// Terminal branch for enduses with technologies: service accounting, switch
/// application, conversion back to fuel and technology-shaped profiles.
fn calculate_with_technologies(
    enduse: &str,
    fuel: &FuelMap,
    config: &EnduseConfig,
    registry: &TechnologyRegistry,
    tech_shapes: &IndexMap<String, TechnologyShape>,
    switch_setup: &SwitchSetup,
    years: SimulationYears,
) -> anyhow::Result<EnduseOutput> {
    // base-year service: the fuel entering this branch still has the
    // base-year technology composition, so base-year efficiencies apply
    let base_years = SimulationYears {
        curr_yr: years.base_yr,
        ..years
    };
    let shape_yh = flatten_enduse_shape(&config.shape);
    let breakdown = fuel_to_service(
        fuel,
        &config.tech_fueltype_shares,
        &shape_yh,
        registry,
        base_years,
    )?;

    let service_tech_by: IndexMap<String, f64> = breakdown
        .service_share_tech
        .iter()
        .map(|(name, &share)| (name.clone(), share * breakdown.total_service))
        .collect();

    let service_tech_cy = match switch_setup {
        SwitchSetup::None => service_tech_by,
        SwitchSetup::Service {
            targets_ey,
            sigmoid_params,
        } => {
            let shares_cy = apply_service_switch(
                enduse,
                &breakdown.service_share_tech,
                targets_ey,
                sigmoid_params,
                years.curr_yr,
            )?;
            shares_cy
                .iter()
                .map(|(name, &share)| (name.clone(), share * breakdown.total_service))
                .collect()
        }
        SwitchSetup::Fuel {
            switches,
            sigmoid_params,
        } => {
            let service_fueltype_by: IndexMap<FuelType, f64> = breakdown
                .service_share_fueltype
                .iter()
                .map(|(&fuel_type, &share)| (fuel_type, share * breakdown.total_service))
                .collect();
            apply_fuel_switch(
                enduse,
                &service_tech_by,
                &service_fueltype_by,
                switches,
                sigmoid_params,
                registry,
                years.curr_yr,
            )?
        }
    };

    let (fuel_y, fuel_tech) = service_to_fuel(&service_tech_cy, registry, years)?;

    let fuel_yh = disaggregate_with_technology_shapes(&fuel_tech, tech_shapes, registry)?;
    let fuel_yd = daily_from_hourly(&fuel_yh);
    let peak_day = get_peak_day(&fuel_yd);
    let fuel_peak_dh = technology_peak_day_profile(&fuel_tech, tech_shapes, registry, peak_day)?;
    let fuel_peak_h = get_peak_hour(&fuel_peak_dh);

    assert_fuel_conserved(enduse, &fuel_y, &fuel_yd, &fuel_yh)?;
    tracing::debug!(enduse, peak_day, "technology branch complete");

    Ok(EnduseOutput {
        fuel_y,
        fuel_yd,
        fuel_yh,
        fuel_peak_dh,
        fuel_peak_h,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diffusion::{fit_sigmoid, FitPolicy};
    use crate::core::units::{DAYS_PER_YEAR, HOURS_PER_DAY, HOURS_PER_YEAR};
    use crate::input::{DiffusionMethod, LoadShape, TechnologyInput};
    use approx::assert_relative_eq;
    use indexmap::indexmap;
    use rstest::*;

    #[fixture]
    fn years() -> SimulationYears {
        SimulationYears {
            base_yr: 2015,
            curr_yr: 2030,
            end_yr: 2050,
        }
    }

    fn neutral_assumptions() -> ScenarioAssumptions {
        ScenarioAssumptions {
            base_yr: 2015,
            end_yr: 2050,
            fuel_prices: IndexMap::new(),
            smart_meter: SmartMeterAssumptions {
                penetration_by: 0.,
                penetration_ey: 0.,
                diffusion_method: DiffusionMethod::Linear,
                sig_midpoint: 0.,
                sig_steepness: 1.,
            },
            heat_pump_split: None,
        }
    }

    fn uniform_shape() -> LoadShape {
        LoadShape {
            shape_yd: vec![1. / DAYS_PER_YEAR as f64; DAYS_PER_YEAR],
            shape_dh: vec![vec![1. / HOURS_PER_DAY as f64; HOURS_PER_DAY]; DAYS_PER_YEAR],
            shape_peak_dh: Some(vec![1. / HOURS_PER_DAY as f64; HOURS_PER_DAY]),
            peak_day_factor: 1.2,
        }
    }

    fn neutral_config() -> EnduseConfig {
        EnduseConfig {
            tech_fueltype_shares: IndexMap::new(),
            shape: uniform_shape(),
            smart_meter_saving: 0.,
            overall_change: OverallChange {
                factor_ey: 1.,
                diffusion_method: DiffusionMethod::Linear,
                sig_midpoint: 0.,
                sig_steepness: 1.,
            },
            elasticity: 0.,
            climate_sensitivity: ClimateSensitivity::None,
        }
    }

    #[rstest]
    fn should_only_correct_climate_sensitive_enduses() {
        let fuel = indexmap! { FuelType::Gas => 100. };
        let climate = ClimateFactors {
            heating: 0.9,
            cooling: 1.3,
        };

        let heating = apply_climate_correction(&fuel, ClimateSensitivity::Heating, &climate);
        let none = apply_climate_correction(&fuel, ClimateSensitivity::None, &climate);

        assert_relative_eq!(heating[&FuelType::Gas], 90.);
        assert_relative_eq!(none[&FuelType::Gas], 100.);
    }

    #[rstest]
    fn should_save_fuel_proportionally_to_new_smart_meters(years: SimulationYears) {
        let fuel = indexmap! { FuelType::Electricity => 100. };
        let smart_meter = SmartMeterAssumptions {
            penetration_by: 0.1,
            penetration_ey: 0.8,
            diffusion_method: DiffusionMethod::Linear,
            sig_midpoint: 0.,
            sig_steepness: 1.,
        };

        // 15 of 35 years elapsed: penetration 0.1 + 0.7 * 3/7 = 0.4
        let result = apply_smart_meter_savings(&fuel, 0.03, &smart_meter, years);
        assert_relative_eq!(
            result[&FuelType::Electricity],
            100. * (1. - 0.3 * 0.03),
            max_relative = 1e-9
        );
    }

    #[rstest]
    fn should_reach_overall_change_factor_at_end_year() {
        let fuel = indexmap! { FuelType::Gas => 100. };
        let change = OverallChange {
            factor_ey: 1.4,
            diffusion_method: DiffusionMethod::Sigmoid,
            sig_midpoint: 0.,
            sig_steepness: 1.,
        };
        let at_end = SimulationYears {
            base_yr: 2015,
            curr_yr: 2050,
            end_yr: 2050,
        };

        let result = apply_overall_change(&fuel, &change, at_end);
        assert_relative_eq!(result[&FuelType::Gas], 140., max_relative = 1e-9);
    }

    #[test]
    fn should_scale_with_scenario_driver() {
        let fuel = indexmap! { FuelType::Gas => 100. };

        let grown = apply_scenario_driver(&fuel, Some(&DriverValues { by: 2., cy: 3. }));
        assert_relative_eq!(grown[&FuelType::Gas], 150.);

        let degenerate = apply_scenario_driver(&fuel, Some(&DriverValues { by: 0., cy: 3. }));
        assert_relative_eq!(degenerate[&FuelType::Gas], 100.);
    }

    #[rstest]
    fn should_dampen_demand_for_rising_prices(years: SimulationYears) {
        let fuel = indexmap! { FuelType::Gas => 100. };
        let prices = indexmap! {
            2015_u32 => indexmap! { FuelType::Gas => 2. },
            2030_u32 => indexmap! { FuelType::Gas => 8. },
        };

        let result = apply_elasticity(&fuel, -0.5, &prices, years);
        assert_relative_eq!(result[&FuelType::Gas], 50., max_relative = 1e-9);
    }

    #[rstest]
    fn should_pass_through_fuel_without_prices(years: SimulationYears) {
        let fuel = indexmap! { FuelType::Gas => 100. };
        let result = apply_elasticity(&fuel, -0.5, &IndexMap::new(), years);
        assert_relative_eq!(result[&FuelType::Gas], 100.);
    }

    #[rstest]
    fn should_run_cascade_without_technologies(years: SimulationYears) {
        let fuel_by = indexmap! { FuelType::Electricity => 365. * 24. };
        let config = neutral_config();
        let registry = TechnologyRegistry::default();

        let output = calculate_enduse(
            "lighting",
            &fuel_by,
            &config,
            &registry,
            &IndexMap::new(),
            &neutral_assumptions(),
            &ClimateFactors {
                heating: 1.,
                cooling: 1.,
            },
            None,
            &SwitchSetup::None,
            years,
        )
        .unwrap();

        // neutral assumptions leave the yearly total untouched
        assert_relative_eq!(output.fuel_y[&FuelType::Electricity], 365. * 24.);
        assert_eq!(output.fuel_yh[&FuelType::Electricity].len(), HOURS_PER_YEAR);
        assert_eq!(output.fuel_yd[&FuelType::Electricity].len(), DAYS_PER_YEAR);
        assert_eq!(output.fuel_peak_dh[&FuelType::Electricity].len(), HOURS_PER_DAY);
        // uniform profile: every hour carries 1.0, peak day scaled by 1.2
        assert_relative_eq!(
            output.fuel_peak_h[&FuelType::Electricity],
            1.2,
            max_relative = 1e-9
        );
    }

    fn tech_input(fuel_type: FuelType, eff_by: f64) -> TechnologyInput {
        TechnologyInput {
            fuel_type,
            eff_by,
            eff_ey: eff_by,
            eff_achieved: 1.0,
            diffusion_method: DiffusionMethod::Linear,
            market_entry: 2010,
        }
    }

    fn uniform_tech_shape() -> TechnologyShape {
        TechnologyShape {
            shape_yh: vec![1. / HOURS_PER_YEAR as f64; HOURS_PER_YEAR],
            shape_peak_dh: None,
        }
    }

    #[rstest]
    fn should_shift_fuel_between_fueltypes_under_service_switch() {
        let registry = TechnologyRegistry::from_inputs(
            &indexmap! {
                "boiler_gas".to_string() => tech_input(FuelType::Gas, 0.8),
                "boiler_elec".to_string() => tech_input(FuelType::Electricity, 2.5),
            },
            None,
        )
        .unwrap();
        let tech_shapes = indexmap! {
            "boiler_gas".to_string() => uniform_tech_shape(),
            "boiler_elec".to_string() => uniform_tech_shape(),
        };
        let mut config = neutral_config();
        config.tech_fueltype_shares = indexmap! {
            FuelType::Gas => indexmap! { "boiler_gas".to_string() => 1.0 },
            FuelType::Electricity => indexmap! { "boiler_elec".to_string() => 1.0 },
        };
        let fuel_by = indexmap! { FuelType::Gas => 100., FuelType::Electricity => 20. };

        // base-year service shares: 80/130 gas, 50/130 electricity; target
        // pushes the electric boiler to 70% of service by 2050
        let share_elec_by = 50. / 130.;
        let fit = fit_sigmoid(
            [2015., 2050.],
            [share_elec_by, 0.7],
            0.9,
            &FitPolicy::default(),
        )
        .unwrap();
        let switch_setup = SwitchSetup::Service {
            targets_ey: indexmap! {
                "boiler_elec".to_string() => 0.7,
                "boiler_gas".to_string() => 0.3,
            },
            sigmoid_params: indexmap! { "boiler_elec".to_string() => fit },
        };
        let at_end = SimulationYears {
            base_yr: 2015,
            curr_yr: 2050,
            end_yr: 2050,
        };

        let output = calculate_enduse(
            "space_heating",
            &fuel_by,
            &config,
            &registry,
            &tech_shapes,
            &neutral_assumptions(),
            &ClimateFactors {
                heating: 1.,
                cooling: 1.,
            },
            None,
            &switch_setup,
            at_end,
        )
        .unwrap();

        // 70% of 130 service units from electricity at eff 2.5, 30% from gas at 0.8
        assert_relative_eq!(
            output.fuel_y[&FuelType::Electricity],
            0.7 * 130. / 2.5,
            epsilon = 0.2
        );
        assert_relative_eq!(
            output.fuel_y[&FuelType::Gas],
            0.3 * 130. / 0.8,
            epsilon = 0.2
        );
    }
}
