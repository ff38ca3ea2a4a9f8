//! The switch engine: redistribution of energy service between technologies
//! under fuel switch or service switch assumptions.
//!
//! Both switch kinds share the same skeleton: technologies gaining service
//! follow their fitted adoption sigmoid, and whatever they gain is taken from
//! the shrinking technologies in proportion to each one's weight in the pool
//! being eaten into. For service switches the pool is all decreasing
//! technologies; for fuel switches it is the technologies consuming the
//! replaced fueltype.

use crate::core::diffusion::SigmoidParameters;
use crate::core::technology::TechnologyRegistry;
use crate::errors::DemandError;
use crate::input::{FuelSwitchInput, FuelType};
use anyhow::bail;
use indexmap::IndexMap;

/// Negative service shares no larger than this are floating-point noise and
/// are clamped to zero; anything beyond it is a modeling inconsistency.
pub(crate) const NEGATIVE_SERVICE_TOLERANCE: f64 = 1e-6;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TechnologyPartition {
    pub increasing: Vec<String>,
    pub decreasing: Vec<String>,
    pub constant: Vec<String>,
}

/// Partition technologies by comparing base-year shares against end-year
/// targets. Technologies without a target are constant.
pub fn partition_technologies(
    shares_by: &IndexMap<String, f64>,
    targets_ey: &IndexMap<String, f64>,
) -> TechnologyPartition {
    let mut partition = TechnologyPartition::default();
    for (tech_name, &share_by) in shares_by {
        match targets_ey.get(tech_name) {
            Some(&target) if target > share_by => partition.increasing.push(tech_name.clone()),
            Some(&target) if target < share_by => partition.decreasing.push(tech_name.clone()),
            _ => partition.constant.push(tech_name.clone()),
        }
    }
    partition
}

/// Current-year service shares under a service switch.
///
/// Increasing technologies are read off their fitted sigmoid; the aggregate
/// share they have gained since the base year is removed from the decreasing
/// technologies pro rata to each one's base-year weight in the decreasing
/// pool. Constant technologies keep their base-year share.
///
/// Adoption curves are fitted from the declared national anchors, so a
/// technology can sit below its end-year target in one region while shrinking
/// nationally. Without a fitted curve it gains nothing and keeps its regional
/// base-year share.
pub fn apply_service_switch(
    enduse: &str,
    service_share_by: &IndexMap<String, f64>,
    targets_ey: &IndexMap<String, f64>,
    sigmoid_params: &IndexMap<String, SigmoidParameters>,
    curr_yr: u32,
) -> anyhow::Result<IndexMap<String, f64>> {
    let mut partition = partition_technologies(service_share_by, targets_ey);

    let mut diffused_shares = IndexMap::new();
    let mut without_curve = Vec::new();
    for tech_name in &partition.increasing {
        match sigmoid_params.get(tech_name) {
            Some(parameters) => {
                diffused_shares.insert(tech_name.clone(), parameters.evaluate(curr_yr));
            }
            None => {
                tracing::debug!(
                    enduse,
                    technology = tech_name.as_str(),
                    "technology increases regionally but has no adoption curve, keeping base-year share"
                );
                without_curve.push(tech_name.clone());
            }
        }
    }
    partition
        .increasing
        .retain(|tech_name| !without_curve.contains(tech_name));
    partition.constant.extend(without_curve);

    redistribute_service_shares(enduse, service_share_by, &partition, &diffused_shares)
}

/// The redistribution algebra, separated from sigmoid evaluation so it can be
/// exercised with exact share values.
fn redistribute_service_shares(
    enduse: &str,
    service_share_by: &IndexMap<String, f64>,
    partition: &TechnologyPartition,
    diffused_shares: &IndexMap<String, f64>,
) -> anyhow::Result<IndexMap<String, f64>> {
    let decreasing_pool: f64 = partition
        .decreasing
        .iter()
        .map(|tech_name| service_share_by[tech_name])
        .sum();
    let total_gained: f64 = partition
        .increasing
        .iter()
        .map(|tech_name| diffused_shares[tech_name] - service_share_by[tech_name])
        .sum();

    let mut shares_cy = IndexMap::new();
    for (tech_name, &share_by) in service_share_by {
        let share_cy = if partition.increasing.contains(tech_name) {
            diffused_shares[tech_name]
        } else if partition.decreasing.contains(tech_name) && decreasing_pool > 0. {
            let relative_weight = share_by / decreasing_pool;
            let reduced = share_by - total_gained * relative_weight;
            if reduced < -NEGATIVE_SERVICE_TOLERANCE {
                bail!(DemandError::Consistency(format!(
                    "service switch drives technology '{tech_name}' in enduse '{enduse}' to share {reduced}"
                )));
            }
            if reduced < 0. {
                tracing::warn!(
                    enduse,
                    technology = tech_name.as_str(),
                    share = reduced,
                    "clamping marginally negative service share to zero"
                );
            }
            reduced.max(0.)
        } else {
            share_by
        };
        shares_cy.insert(tech_name.clone(), share_cy);
    }

    Ok(shares_cy)
}

/// Anchor values the sigmoid fitter needs for one switch: the target share at
/// the switch completion year and the logistic asymptote.
#[derive(Clone, Copy, Debug)]
pub struct SwitchAnchors {
    pub target_share: f64,
    pub l_parameter: f64,
    pub switch_yr: u32,
}

/// Anchors for a fuel switch: the installed technology ends up with its
/// base-year share plus the switched slice of the replaced fueltype's service,
/// capped at the theoretical maximum.
pub fn fuel_switch_anchors(
    switch: &FuelSwitchInput,
    share_by_install: f64,
    fueltype_service_share: f64,
) -> SwitchAnchors {
    SwitchAnchors {
        target_share: share_by_install
            + switch.share_fuel_consumption_switched * fueltype_service_share,
        l_parameter: (share_by_install + switch.max_theoretical_switch * fueltype_service_share)
            .min(1.),
        switch_yr: switch.switch_yr,
    }
}

/// Current-year service per technology (in service units, not shares) under
/// fuel switches.
///
/// Each installed technology's gain since the base year is removed from the
/// technologies consuming the replaced fueltype, weighted by their fraction of
/// service within that fueltype. A resulting negative service is fatal here:
/// validated switch records guarantee non-negativity by construction, so a
/// negative value means broken model input.
pub fn apply_fuel_switch(
    enduse: &str,
    service_tech_by: &IndexMap<String, f64>,
    service_fueltype_by: &IndexMap<FuelType, f64>,
    fuel_switches: &[FuelSwitchInput],
    sigmoid_params: &IndexMap<String, SigmoidParameters>,
    registry: &TechnologyRegistry,
    curr_yr: u32,
) -> anyhow::Result<IndexMap<String, f64>> {
    let total_service: f64 = service_tech_by.values().sum();
    let mut service_cy = service_tech_by.clone();

    for switch in fuel_switches.iter().filter(|s| s.enduse == enduse) {
        let install_name = registry.resolve_name(&switch.technology_install);
        let parameters = sigmoid_params.get(install_name).ok_or_else(|| {
            DemandError::Configuration(format!(
                "no fitted sigmoid for installed technology '{install_name}' in enduse '{enduse}'"
            ))
        })?;
        let share_by_install = service_tech_by
            .get(install_name)
            .copied()
            .unwrap_or_default()
            / total_service.max(f64::MIN_POSITIVE);
        let gained_service = (parameters.evaluate(curr_yr) - share_by_install) * total_service;
        if gained_service <= 0. {
            continue;
        }

        let replaced_pool = service_fueltype_by
            .get(&switch.fueltype_replace)
            .copied()
            .unwrap_or_default();
        if replaced_pool <= 0. {
            continue;
        }

        *service_cy.entry(install_name.to_string()).or_default() += gained_service;

        for (tech_name, &service_by) in service_tech_by {
            if tech_name == install_name {
                continue;
            }
            let technology = registry.get(tech_name)?;
            if technology.fuel_type != switch.fueltype_replace {
                continue;
            }
            let within_fueltype_share = service_by / replaced_pool;
            let reduction = gained_service * within_fueltype_share;
            let remaining = service_cy[tech_name] - reduction;
            if remaining < -NEGATIVE_SERVICE_TOLERANCE {
                bail!(DemandError::Consistency(format!(
                    "fuel switch in enduse '{enduse}' replacing fueltype '{}' drives technology '{tech_name}' to negative service {remaining}",
                    switch.fueltype_replace
                )));
            }
            if remaining < 0. {
                tracing::warn!(
                    enduse,
                    technology = tech_name.as_str(),
                    service = remaining,
                    "clamping marginally negative service to zero"
                );
            }
            service_cy[tech_name] = remaining.max(0.);
        }
    }

    Ok(service_cy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diffusion::{fit_sigmoid, FitPolicy};
    use crate::input::{DiffusionMethod, TechnologyInput};
    use approx::assert_relative_eq;
    use indexmap::indexmap;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[test]
    fn should_partition_by_share_direction() {
        let shares_by = indexmap! {
            "a".to_string() => 0.6,
            "b".to_string() => 0.3,
            "c".to_string() => 0.1,
        };
        let targets = indexmap! {
            "a".to_string() => 0.2,
            "b".to_string() => 0.7,
        };

        let partition = partition_technologies(&shares_by, &targets);

        assert_eq!(partition.increasing, vec!["b".to_string()]);
        assert_eq!(partition.decreasing, vec!["a".to_string()]);
        assert_eq!(partition.constant, vec!["c".to_string()]);
    }

    #[test]
    fn should_conserve_total_share_under_service_switch() {
        let shares_by = indexmap! {
            "old_boiler".to_string() => 0.6,
            "new_boiler".to_string() => 0.4,
        };
        let targets = indexmap! {
            "old_boiler".to_string() => 0.3,
            "new_boiler".to_string() => 0.7,
        };
        let fit = fit_sigmoid([2015., 2050.], [0.4, 0.7], 0.8, &FitPolicy::default()).unwrap();
        let params = indexmap! { "new_boiler".to_string() => fit };

        let shares_cy =
            apply_service_switch("space_heating", &shares_by, &targets, &params, 2035).unwrap();

        let total: f64 = shares_cy.values().sum();
        assert_relative_eq!(total, 1., epsilon = 1e-4);
        assert!(shares_cy["new_boiler"] > 0.4);
        assert!(shares_cy["old_boiler"] < 0.6);
    }

    #[test]
    fn should_reach_target_shares_at_switch_year() {
        let shares_by = indexmap! {
            "old_boiler".to_string() => 0.6,
            "new_boiler".to_string() => 0.4,
        };
        let targets = indexmap! {
            "old_boiler".to_string() => 0.3,
            "new_boiler".to_string() => 0.7,
        };
        let fit = fit_sigmoid([2015., 2050.], [0.4, 0.7], 0.8, &FitPolicy::default()).unwrap();
        let params = indexmap! { "new_boiler".to_string() => fit };

        let shares_cy =
            apply_service_switch("space_heating", &shares_by, &targets, &params, 2050).unwrap();

        assert_relative_eq!(shares_cy["new_boiler"], 0.7, epsilon = 1e-3);
        assert_relative_eq!(shares_cy["old_boiler"], 0.3, epsilon = 1e-3);
    }

    #[test]
    fn should_keep_share_for_technology_without_adoption_curve() {
        // the electric boiler shrinks in the declared national anchors, so no
        // curve was fitted for it; in this region it starts below its
        // end-year target and must simply keep its base-year share
        let shares_by = indexmap! {
            "boiler_elec".to_string() => 0.238,
            "boiler_gas".to_string() => 0.762,
        };
        let targets = indexmap! {
            "boiler_elec".to_string() => 0.4,
            "boiler_gas".to_string() => 0.6,
        };
        let fit = fit_sigmoid([2015., 2050.], [0.5, 0.6], 0.8, &FitPolicy::default()).unwrap();
        let params = indexmap! { "boiler_gas".to_string() => fit };

        let shares_cy =
            apply_service_switch("space_heating", &shares_by, &targets, &params, 2030).unwrap();

        assert_relative_eq!(shares_cy["boiler_elec"], 0.238);
        assert_relative_eq!(shares_cy["boiler_gas"], 0.762);
    }

    #[test]
    fn should_clamp_marginally_negative_share_to_zero() {
        let shares_by = indexmap! {
            "shrinking".to_string() => 0.1,
            "growing".to_string() => 0.9,
        };
        let partition = TechnologyPartition {
            increasing: vec!["growing".to_string()],
            decreasing: vec!["shrinking".to_string()],
            constant: vec![],
        };
        let diffused = indexmap! { "growing".to_string() => 0.9 + 0.1 + 1e-9 };

        let shares_cy =
            redistribute_service_shares("space_heating", &shares_by, &partition, &diffused)
                .unwrap();

        assert_eq!(shares_cy["shrinking"], 0.);
    }

    #[test]
    fn should_abort_on_large_negative_share() {
        let shares_by = indexmap! {
            "shrinking".to_string() => 0.1,
            "growing".to_string() => 0.9,
        };
        let partition = TechnologyPartition {
            increasing: vec!["growing".to_string()],
            decreasing: vec!["shrinking".to_string()],
            constant: vec![],
        };
        let diffused = indexmap! { "growing".to_string() => 1.1 };

        assert!(
            redistribute_service_shares("space_heating", &shares_by, &partition, &diffused)
                .is_err()
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

    #[fixture]
    fn two_boiler_registry() -> TechnologyRegistry {
        TechnologyRegistry::from_inputs(
            &indexmap! {
                "boiler_gas".to_string() => tech_input(FuelType::Gas, 0.8),
                "boiler_elec".to_string() => tech_input(FuelType::Electricity, 2.5),
            },
            None,
        )
        .unwrap()
    }

    fn gas_to_elec_switch(share_switched: f64) -> FuelSwitchInput {
        FuelSwitchInput {
            enduse: "space_heating".into(),
            fueltype_replace: FuelType::Gas,
            technology_install: "boiler_elec".into(),
            switch_yr: 2030,
            share_fuel_consumption_switched: share_switched,
            max_theoretical_switch: 0.6,
        }
    }

    #[rstest]
    fn should_move_service_from_gas_to_electricity(two_boiler_registry: TechnologyRegistry) {
        // base-year service from fuel {gas: 100, elec: 20}: 80 + 50 = 130
        let service_tech_by = indexmap! {
            "boiler_gas".to_string() => 80.,
            "boiler_elec".to_string() => 50.,
        };
        let service_fueltype_by = indexmap! {
            FuelType::Gas => 80.,
            FuelType::Electricity => 50.,
        };
        let switch = gas_to_elec_switch(0.5);
        let anchors = fuel_switch_anchors(&switch, 50. / 130., 80. / 130.);
        let fit = fit_sigmoid(
            [2015., 2030.],
            [50. / 130., anchors.target_share],
            anchors.l_parameter,
            &FitPolicy::default(),
        )
        .unwrap();
        let params = indexmap! { "boiler_elec".to_string() => fit };

        let service_cy = apply_fuel_switch(
            "space_heating",
            &service_tech_by,
            &service_fueltype_by,
            &[switch],
            &params,
            &two_boiler_registry,
            2030,
        )
        .unwrap();

        // half the gas service (40 units) has moved to the installed technology
        assert_relative_eq!(service_cy["boiler_elec"], 90., epsilon = 0.1);
        assert_relative_eq!(service_cy["boiler_gas"], 40., epsilon = 0.1);

        // the loss of boiler_gas relative to the gained service equals its
        // base-year share of gas-fueltype service (here the whole of it)
        let gained = service_cy["boiler_elec"] - 50.;
        let lost = 80. - service_cy["boiler_gas"];
        assert_relative_eq!(lost / gained, 1., epsilon = 1e-6);
    }

    #[rstest]
    fn should_clamp_marginally_negative_service_from_fuel_switch(
        two_boiler_registry: TechnologyRegistry,
    ) {
        let service_tech_by = indexmap! {
            "boiler_gas".to_string() => 10.,
            "boiler_elec".to_string() => 60.,
        };
        let service_fueltype_by = indexmap! {
            FuelType::Gas => 10.,
            FuelType::Electricity => 60.,
        };
        // saturated curve promising the gas pool plus a sliver of noise
        let params = indexmap! {
            "boiler_elec".to_string() => SigmoidParameters {
                l_parameter: (70. + 1e-9) / 70.,
                midpoint: 10.,
                steepness: 1.,
            },
        };

        let service_cy = apply_fuel_switch(
            "space_heating",
            &service_tech_by,
            &service_fueltype_by,
            &[gas_to_elec_switch(0.5)],
            &params,
            &two_boiler_registry,
            3000,
        )
        .unwrap();

        assert_eq!(service_cy["boiler_gas"], 0.);
        assert_relative_eq!(service_cy["boiler_elec"], 70., epsilon = 1e-6);
    }

    #[test]
    fn should_abort_on_negative_service_from_fuel_switch() {
        let registry = TechnologyRegistry::from_inputs(
            &indexmap! {
                "boiler_gas".to_string() => tech_input(FuelType::Gas, 0.8),
                "boiler_elec".to_string() => tech_input(FuelType::Electricity, 2.5),
                "boiler_oil".to_string() => tech_input(FuelType::Oil, 0.7),
            },
            None,
        )
        .unwrap();
        let service_tech_by = indexmap! {
            "boiler_gas".to_string() => 10.,
            "boiler_elec".to_string() => 60.,
            "boiler_oil".to_string() => 60.,
        };
        let service_fueltype_by = indexmap! {
            FuelType::Gas => 10.,
            FuelType::Electricity => 60.,
            FuelType::Oil => 60.,
        };
        // a hand-built curve promising far more service than the gas pool holds
        let params = indexmap! {
            "boiler_elec".to_string() => SigmoidParameters {
                l_parameter: 1.,
                midpoint: 10.,
                steepness: 1.,
            },
        };

        assert!(apply_fuel_switch(
            "space_heating",
            &service_tech_by,
            &service_fueltype_by,
            &[gas_to_elec_switch(0.5)],
            &params,
            &registry,
            2030,
        )
        .is_err());
    }
}
