//! The technology registry: static per-technology attributes and the derived
//! quantities the rest of the engine reads from them.

use crate::core::diffusion::diffusion_fraction;
use crate::errors::DemandError;
use crate::input::{DiffusionMethod, FuelType, TechnologyInput};
use anyhow::bail;
use indexmap::IndexMap;

#[derive(Clone, Debug)]
pub struct Technology {
    pub name: String,
    pub fuel_type: FuelType,
    pub eff_by: f64,
    pub eff_ey: f64,
    pub eff_achieved: f64,
    pub diffusion_method: DiffusionMethod,
    pub market_entry: u32,
}

impl Technology {
    fn from_input(name: &str, input: &TechnologyInput) -> Self {
        Self {
            name: name.to_string(),
            fuel_type: input.fuel_type,
            eff_by: input.eff_by,
            eff_ey: input.eff_ey,
            eff_achieved: input.eff_achieved,
            diffusion_method: input.diffusion_method,
            market_entry: input.market_entry,
        }
    }

    /// Efficiency in the current year: the base-year value plus the achieved
    /// fraction of the base-to-end-year gain, diffused over the simulation
    /// period. Never passes the end-year value.
    pub fn efficiency(&self, base_yr: u32, curr_yr: u32, end_yr: u32) -> f64 {
        let diffusion =
            diffusion_fraction(self.diffusion_method, base_yr, curr_yr, end_yr, 0., 1.);
        let efficiency = self.eff_by + (self.eff_ey - self.eff_by) * self.eff_achieved * diffusion;
        if self.eff_ey >= self.eff_by {
            efficiency.min(self.eff_ey)
        } else {
            efficiency.max(self.eff_ey)
        }
    }
}

/// Immutable registry of all technologies, constructed once at model setup.
#[derive(Clone, Debug, Default)]
pub struct TechnologyRegistry {
    technologies: IndexMap<String, Technology>,
    /// Constituent technology name -> name of the averaged technology that
    /// replaced it (heat pump synthesis).
    replacements: IndexMap<String, String>,
}

impl TechnologyRegistry {
    /// Build the registry. When a heat pump split is given, its constituent
    /// technologies (e.g. ASHP and GSHP) are replaced, per fueltype, by a
    /// single averaged technology whose attributes are the split-weighted
    /// averages of the constituents.
    pub fn from_inputs(
        inputs: &IndexMap<String, TechnologyInput>,
        heat_pump_split: Option<&IndexMap<String, f64>>,
    ) -> anyhow::Result<Self> {
        let mut technologies: IndexMap<String, Technology> = inputs
            .iter()
            .map(|(name, input)| (name.clone(), Technology::from_input(name, input)))
            .collect();
        let mut replacements = IndexMap::new();

        if let Some(split) = heat_pump_split {
            let mut by_fueltype: IndexMap<FuelType, Vec<(String, f64)>> = IndexMap::new();
            for (name, &fraction) in split {
                let technology = technologies.get(name).ok_or_else(|| {
                    DemandError::Configuration(format!(
                        "heat pump split references unknown technology '{name}'"
                    ))
                })?;
                by_fueltype
                    .entry(technology.fuel_type)
                    .or_default()
                    .push((name.clone(), fraction));
            }
            for (fuel_type, constituents) in by_fueltype {
                let averaged = average_heat_pump(fuel_type, &constituents, &technologies);
                tracing::info!(
                    technology = averaged.name.as_str(),
                    fueltype = %fuel_type,
                    "synthesized averaged heat pump technology"
                );
                for (name, _) in &constituents {
                    technologies.shift_remove(name);
                    replacements.insert(name.clone(), averaged.name.clone());
                }
                technologies.insert(averaged.name.clone(), averaged);
            }
        }

        Ok(Self {
            technologies,
            replacements,
        })
    }

    pub fn get(&self, name: &str) -> anyhow::Result<&Technology> {
        match self.technologies.get(name) {
            Some(technology) => Ok(technology),
            None => bail!(DemandError::Configuration(format!(
                "technology '{name}' is not in the registry"
            ))),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.technologies.contains_key(name)
    }

    /// Resolve a technology name through any heat pump replacement.
    pub fn resolve_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.replacements.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Technology)> {
        self.technologies.iter()
    }
}

/// Split-weighted average of the constituent heat pump technologies sharing
/// one fueltype. The split fractions are normalized within the fueltype so
/// that a split spread over several fueltypes still averages correctly.
fn average_heat_pump(
    fuel_type: FuelType,
    constituents: &[(String, f64)],
    technologies: &IndexMap<String, Technology>,
) -> Technology {
    let fraction_total: f64 = constituents.iter().map(|(_, fraction)| fraction).sum();
    let weighted = |attribute: fn(&Technology) -> f64| -> f64 {
        constituents
            .iter()
            .map(|(name, fraction)| attribute(&technologies[name]) * fraction / fraction_total)
            .sum()
    };

    Technology {
        name: format!("av_heat_pump_{fuel_type}"),
        fuel_type,
        eff_by: weighted(|t| t.eff_by),
        eff_ey: weighted(|t| t.eff_ey),
        eff_achieved: weighted(|t| t.eff_achieved),
        diffusion_method: technologies[&constituents[0].0].diffusion_method,
        market_entry: constituents
            .iter()
            .map(|(name, _)| technologies[name].market_entry)
            .min()
            .unwrap_or_default(),
    }
}
