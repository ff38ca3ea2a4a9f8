//! Deserialized model inputs.
//!
//! Everything the engine consumes arrives through the types here: the
//! technology registry, switch assumption tables, load shape lookup tables and
//! per-region base-year fuel. Raw file ingestion (CSV readers, weather files)
//! is a collaborator concern; this module only defines the already-parsed
//! representation and its validation.

use crate::core::units::{DAYS_PER_YEAR, HOURS_PER_DAY, HOURS_PER_YEAR};
use crate::errors::DemandError;
use anyhow::bail;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum_macros::EnumIter;

/// Yearly fuel per fueltype, in the model's common energy unit (GWh).
pub type FuelMap = IndexMap<FuelType, f64>;

/// Tolerance for share tables that must sum to one.
pub(crate) const SHARE_SUM_TOLERANCE: f64 = 1e-5;

#[derive(Clone, Copy, Debug, Deserialize, Serialize, EnumIter, Eq, Hash, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FuelType {
    SolidFuel,
    Gas,
    Electricity,
    Oil,
    HeatSold,
    Biomass,
    Hydrogen,
    Heat,
}

impl Display for FuelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let json_string = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", json_string.trim_matches('"'))
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DiffusionMethod {
    Linear,
    Sigmoid,
}

/// One record of the technology registry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TechnologyInput {
    pub fuel_type: FuelType,
    /// Base-year efficiency (service out per fuel in).
    pub eff_by: f64,
    /// End-year efficiency.
    pub eff_ey: f64,
    /// Fraction of the theoretical efficiency gain actually realized, 0..=1.
    pub eff_achieved: f64,
    pub diffusion_method: DiffusionMethod,
    /// Year before which adoption of this technology is zero.
    pub market_entry: u32,
}

/// Scenario assumption moving a share of one fueltype's consumption in an
/// enduse to a newly installed technology.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FuelSwitchInput {
    pub enduse: String,
    pub fueltype_replace: FuelType,
    pub technology_install: String,
    /// Year by which the switch is complete.
    pub switch_yr: u32,
    /// Share of the replaced fueltype's consumption that is switched, 0..=1.
    pub share_fuel_consumption_switched: f64,
    /// Upper bound on how much of that fueltype could ever be switched.
    pub max_theoretical_switch: f64,
}

/// Scenario assumption directly specifying a technology's future share of
/// energy service for an enduse.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceSwitchInput {
    pub enduse: String,
    pub technology: String,
    pub service_share_by: f64,
    pub service_share_ey: f64,
    /// Year by which the target share is reached.
    pub switch_yr: u32,
    /// Cap on the achievable share, used as the logistic asymptote.
    pub max_share: f64,
}

/// Enduse-level load shape lookup table.
///
/// `shape_yd` distributes a yearly total over days (365 fractions summing to
/// one); `shape_dh` distributes each day over hours (365 rows of 24 fractions,
/// each row summing to one).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoadShape {
    pub shape_yd: Vec<f64>,
    pub shape_dh: Vec<Vec<f64>>,
    /// Hourly profile of the peak day, where one is known in advance.
    pub shape_peak_dh: Option<Vec<f64>>,
    /// Ratio of peak-day demand to an average day, for enduses calculated
    /// without technologies.
    pub peak_day_factor: f64,
}

/// Technology-level load shape: a fraction-of-year value for every hour.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TechnologyShape {
    pub shape_yh: Vec<f64>,
    /// Peak-day hourly profile. Hybrid technologies have none pre-computed and
    /// fall back to the peak-day row of `shape_yh`.
    pub shape_peak_dh: Option<Vec<f64>>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClimateSensitivity {
    #[default]
    None,
    Heating,
    Cooling,
}

fn default_sig_midpoint() -> f64 {
    0.
}

fn default_sig_steepness() -> f64 {
    1.
}

/// Generic change of overall demand for an enduse by the end year, e.g. a
/// factor of 1.2 for 20% growth, diffused over the simulation period.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct OverallChange {
    pub factor_ey: f64,
    pub diffusion_method: DiffusionMethod,
    #[serde(default = "default_sig_midpoint")]
    pub sig_midpoint: f64,
    #[serde(default = "default_sig_steepness")]
    pub sig_steepness: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EnduseConfig {
    /// Technologies serving this enduse, grouped by the fueltype they consume,
    /// with each technology's base-year share of that fueltype's fuel. Empty
    /// means the enduse is calculated without technologies.
    #[serde(default)]
    pub tech_fueltype_shares: IndexMap<FuelType, IndexMap<String, f64>>,
    pub shape: LoadShape,
    /// Demand saved by smart metering once fully penetrated, 0..=1.
    pub smart_meter_saving: f64,
    pub overall_change: OverallChange,
    /// Long-run price elasticity of demand (typically negative).
    pub elasticity: f64,
    #[serde(default)]
    pub climate_sensitivity: ClimateSensitivity,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SmartMeterAssumptions {
    pub penetration_by: f64,
    pub penetration_ey: f64,
    pub diffusion_method: DiffusionMethod,
    #[serde(default = "default_sig_midpoint")]
    pub sig_midpoint: f64,
    #[serde(default = "default_sig_steepness")]
    pub sig_steepness: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScenarioAssumptions {
    pub base_yr: u32,
    pub end_yr: u32,
    /// Fuel price per simulation year and fueltype, for the elasticity stage.
    #[serde(default)]
    pub fuel_prices: IndexMap<u32, FuelMap>,
    pub smart_meter: SmartMeterAssumptions,
    /// Fractions of the heat pump stock per constituent technology (e.g. ASHP
    /// vs GSHP). When present, one averaged heat pump technology is
    /// synthesized per fueltype at setup and replaces its constituents.
    #[serde(default)]
    pub heat_pump_split: Option<IndexMap<String, f64>>,
}

/// Current-year over base-year degree-day ratios for a region.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct ClimateFactors {
    pub heating: f64,
    pub cooling: f64,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct DriverValues {
    pub by: f64,
    pub cy: f64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegionInput {
    pub name: String,
    /// Base-year yearly fuel per enduse.
    pub fuel_by_enduse: IndexMap<String, FuelMap>,
    pub climate: ClimateFactors,
    /// Scenario driver (population, floor area, GVA...) per enduse. A missing
    /// entry means the driver is unchanged.
    #[serde(default)]
    pub scenario_drivers: IndexMap<String, DriverValues>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelInput {
    pub assumptions: ScenarioAssumptions,
    pub technologies: IndexMap<String, TechnologyInput>,
    pub tech_shapes: IndexMap<String, TechnologyShape>,
    #[serde(default)]
    pub fuel_switches: Vec<FuelSwitchInput>,
    #[serde(default)]
    pub service_switches: Vec<ServiceSwitchInput>,
    pub enduses: IndexMap<String, EnduseConfig>,
    pub regions: Vec<RegionInput>,
}

impl ModelInput {
    /// Validate share bounds, switch records and shape tables before any
    /// calculation. Failures are configuration errors and abort the run.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, tech) in &self.technologies {
            if !(0. ..=1.).contains(&tech.eff_achieved) {
                bail!(DemandError::Configuration(format!(
                    "technology '{name}' has eff_achieved {} outside 0..=1",
                    tech.eff_achieved
                )));
            }
        }

        for (enduse, config) in &self.enduses {
            for (fueltype, shares) in &config.tech_fueltype_shares {
                let share_sum: f64 = shares.values().sum();
                if !is_close!(share_sum, 1., abs_tol = SHARE_SUM_TOLERANCE) {
                    bail!(DemandError::Configuration(format!(
                        "technology shares for enduse '{enduse}', fueltype '{fueltype}' sum to {share_sum}, expected 1.0"
                    )));
                }
                for tech in shares.keys() {
                    if !self.technologies.contains_key(tech) {
                        bail!(DemandError::Configuration(format!(
                            "technology '{tech}' referenced by enduse '{enduse}' is not in the registry"
                        )));
                    }
                    if !self.tech_shapes.contains_key(tech) {
                        bail!(DemandError::Configuration(format!(
                            "technology '{tech}' referenced by enduse '{enduse}' has no load shape"
                        )));
                    }
                }
            }
            validate_load_shape(enduse, &config.shape)?;
        }

        for switch in &self.fuel_switches {
            if switch.share_fuel_consumption_switched > switch.max_theoretical_switch {
                bail!(DemandError::Configuration(format!(
                    "fuel switch for enduse '{}' switches {} of fueltype '{}' but only {} is theoretically switchable",
                    switch.enduse,
                    switch.share_fuel_consumption_switched,
                    switch.fueltype_replace,
                    switch.max_theoretical_switch
                )));
            }
            if switch.switch_yr <= self.assumptions.base_yr {
                bail!(DemandError::Configuration(format!(
                    "fuel switch for enduse '{}' completes in {} which is not after the base year {}",
                    switch.enduse, switch.switch_yr, self.assumptions.base_yr
                )));
            }
            self.check_switch_technology(&switch.enduse, &switch.technology_install)?;
        }

        // The declared service switches must cover each enduse completely:
        // shares summing to anything but one at either anchor year would
        // produce current-year shares that never honor the targets.
        let mut anchor_sums: IndexMap<&str, (f64, f64)> = IndexMap::new();
        for switch in &self.service_switches {
            let sums = anchor_sums.entry(switch.enduse.as_str()).or_default();
            sums.0 += switch.service_share_by;
            sums.1 += switch.service_share_ey;
        }
        for (enduse, (by_sum, ey_sum)) in &anchor_sums {
            for (anchor, sum) in [("base", by_sum), ("end", ey_sum)] {
                if !is_close!(*sum, 1., abs_tol = SHARE_SUM_TOLERANCE) {
                    bail!(DemandError::Configuration(format!(
                        "service switch shares for enduse '{enduse}' sum to {sum} at the {anchor} year, expected 1.0"
                    )));
                }
            }
        }

        for switch in &self.service_switches {
            if switch.service_share_ey > switch.max_share {
                bail!(DemandError::Configuration(format!(
                    "service switch for enduse '{}', technology '{}' targets share {} above its cap {}",
                    switch.enduse, switch.technology, switch.service_share_ey, switch.max_share
                )));
            }
            if switch.switch_yr <= self.assumptions.base_yr {
                bail!(DemandError::Configuration(format!(
                    "service switch for enduse '{}' completes in {} which is not after the base year {}",
                    switch.enduse, switch.switch_yr, self.assumptions.base_yr
                )));
            }
            self.check_switch_technology(&switch.enduse, &switch.technology)?;
        }

        // Defining both switch kinds for one enduse is ambiguous and fatal.
        for fuel_switch in &self.fuel_switches {
            if self
                .service_switches
                .iter()
                .any(|s| s.enduse == fuel_switch.enduse)
            {
                bail!(DemandError::Configuration(format!(
                    "enduse '{}' defines both fuel switches and service switches",
                    fuel_switch.enduse
                )));
            }
        }

        if let Some(split) = &self.assumptions.heat_pump_split {
            let split_sum: f64 = split.values().sum();
            if !is_close!(split_sum, 1., abs_tol = SHARE_SUM_TOLERANCE) {
                bail!(DemandError::Configuration(format!(
                    "heat pump split fractions sum to {split_sum}, expected 1.0"
                )));
            }
            for tech in split.keys() {
                if !self.technologies.contains_key(tech) {
                    bail!(DemandError::Configuration(format!(
                        "heat pump split references unknown technology '{tech}'"
                    )));
                }
            }
        }

        for (tech, shape) in &self.tech_shapes {
            if shape.shape_yh.len() != HOURS_PER_YEAR {
                bail!(DemandError::Configuration(format!(
                    "shape_yh for technology '{tech}' has {} entries, expected {HOURS_PER_YEAR}",
                    shape.shape_yh.len()
                )));
            }
            let yh_sum: f64 = shape.shape_yh.iter().sum();
            if !is_close!(yh_sum, 1., abs_tol = SHARE_SUM_TOLERANCE) {
                bail!(DemandError::Configuration(format!(
                    "shape_yh for technology '{tech}' sums to {yh_sum}, expected 1.0"
                )));
            }
            if let Some(peak) = &shape.shape_peak_dh {
                if peak.len() != HOURS_PER_DAY {
                    bail!(DemandError::Configuration(format!(
                        "shape_peak_dh for technology '{tech}' has {} entries, expected {HOURS_PER_DAY}",
                        peak.len()
                    )));
                }
            }
        }

        for region in &self.regions {
            for enduse in region.fuel_by_enduse.keys() {
                if !self.enduses.contains_key(enduse) {
                    bail!(DemandError::Configuration(format!(
                        "region '{}' supplies fuel for undefined enduse '{enduse}'",
                        region.name
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_switch_technology(&self, enduse: &str, technology: &str) -> anyhow::Result<()> {
        if !self.technologies.contains_key(technology) {
            bail!(DemandError::Configuration(format!(
                "switch for enduse '{enduse}' installs technology '{technology}' which is not in the registry"
            )));
        }
        let in_stock = self
            .enduses
            .get(enduse)
            .map(|config| {
                config
                    .tech_fueltype_shares
                    .values()
                    .any(|shares| shares.contains_key(technology))
            })
            .unwrap_or(false);
        if !in_stock {
            bail!(DemandError::Configuration(format!(
                "switch for enduse '{enduse}' installs technology '{technology}' which is not in that enduse's fuel stock"
            )));
        }
        Ok(())
    }
}

fn validate_load_shape(enduse: &str, shape: &LoadShape) -> anyhow::Result<()> {
    if shape.shape_yd.len() != DAYS_PER_YEAR {
        bail!(DemandError::Configuration(format!(
            "shape_yd for enduse '{enduse}' has {} entries, expected {DAYS_PER_YEAR}",
            shape.shape_yd.len()
        )));
    }
    let yd_sum: f64 = shape.shape_yd.iter().sum();
    if !is_close!(yd_sum, 1., abs_tol = SHARE_SUM_TOLERANCE) {
        bail!(DemandError::Configuration(format!(
            "shape_yd for enduse '{enduse}' sums to {yd_sum}, expected 1.0"
        )));
    }
    if shape.shape_dh.len() != DAYS_PER_YEAR {
        bail!(DemandError::Configuration(format!(
            "shape_dh for enduse '{enduse}' has {} rows, expected {DAYS_PER_YEAR}",
            shape.shape_dh.len()
        )));
    }
    for (day, row) in shape.shape_dh.iter().enumerate() {
        if row.len() != HOURS_PER_DAY {
            bail!(DemandError::Configuration(format!(
                "shape_dh for enduse '{enduse}' day {day} has {} entries, expected {HOURS_PER_DAY}",
                row.len()
            )));
        }
        let row_sum: f64 = row.iter().sum();
        if !is_close!(row_sum, 1., abs_tol = SHARE_SUM_TOLERANCE) {
            bail!(DemandError::Configuration(format!(
                "shape_dh for enduse '{enduse}' day {day} sums to {row_sum}, expected 1.0"
            )));
        }
    }
    if let Some(peak) = &shape.shape_peak_dh {
        if peak.len() != HOURS_PER_DAY {
            bail!(DemandError::Configuration(format!(
                "shape_peak_dh for enduse '{enduse}' has {} entries, expected {HOURS_PER_DAY}",
                peak.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    fn minimal_input() -> ModelInput {
        ModelInput {
            assumptions: ScenarioAssumptions {
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
            },
            technologies: IndexMap::new(),
            tech_shapes: IndexMap::new(),
            fuel_switches: vec![],
            service_switches: vec![],
            enduses: IndexMap::new(),
            regions: vec![],
        }
    }

    #[test]
    fn should_reject_service_switch_shares_not_covering_enduse() {
        let mut input = minimal_input();
        input.service_switches = vec![
            ServiceSwitchInput {
                enduse: "space_heating".into(),
                technology: "boiler_a".into(),
                service_share_by: 0.4,
                service_share_ey: 0.9,
                switch_yr: 2030,
                max_share: 0.9,
            },
            ServiceSwitchInput {
                enduse: "space_heating".into(),
                technology: "boiler_b".into(),
                service_share_by: 0.6,
                service_share_ey: 0.5,
                switch_yr: 2030,
                max_share: 0.9,
            },
        ];

        let error = input.validate().unwrap_err();
        assert!(error.to_string().contains("service switch shares"));
    }

    #[test]
    fn should_reject_unnormalized_technology_shape() {
        let mut input = minimal_input();
        input.tech_shapes = indexmap! {
            "boiler".to_string() => TechnologyShape {
                shape_yh: vec![2. / HOURS_PER_YEAR as f64; HOURS_PER_YEAR],
                shape_peak_dh: None,
            },
        };

        let error = input.validate().unwrap_err();
        assert!(error.to_string().contains("shape_yh"));
    }

    #[test]
    fn should_reject_unnormalized_day_shape_row() {
        let mut shape = LoadShape {
            shape_yd: vec![1. / DAYS_PER_YEAR as f64; DAYS_PER_YEAR],
            shape_dh: vec![vec![1. / HOURS_PER_DAY as f64; HOURS_PER_DAY]; DAYS_PER_YEAR],
            shape_peak_dh: None,
            peak_day_factor: 1.,
        };
        shape.shape_dh[100] = vec![0.5; HOURS_PER_DAY];

        let error = validate_load_shape("lighting", &shape).unwrap_err();
        assert!(error.to_string().contains("day 100"));
    }

    #[test]
    fn should_serialize_fueltype_snake_case() {
        assert_eq!(
            serde_json::to_string(&FuelType::SolidFuel).unwrap(),
            "\"solid_fuel\""
        );
        assert_eq!(FuelType::Electricity.to_string(), "electricity");
    }

    #[test]
    fn should_display_every_fueltype_without_quotes() {
        use strum::IntoEnumIterator;
        for fuel_type in FuelType::iter() {
            let displayed = fuel_type.to_string();
            assert!(!displayed.contains('"'), "quoted display for {displayed}");
            assert_eq!(displayed, displayed.to_lowercase());
        }
    }

    #[test]
    fn should_round_trip_switch_records_through_json() {
        let json = r#"{
            "enduse": "space_heating",
            "fueltype_replace": "gas",
            "technology_install": "boiler_elec",
            "switch_yr": 2030,
            "share_fuel_consumption_switched": 0.5,
            "max_theoretical_switch": 0.6
        }"#;
        let switch: FuelSwitchInput = serde_json::from_str(json).unwrap();
        assert_eq!(switch.fueltype_replace, FuelType::Gas);
        assert_eq!(switch.switch_yr, 2030);
    }
}
