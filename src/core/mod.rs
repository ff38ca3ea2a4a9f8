pub mod diffusion;
pub mod enduse;
pub mod load_profile;
pub mod service;
pub mod switches;
pub mod technology;
pub mod units;

/// The three anchor years every cascade stage works against.
#[derive(Clone, Copy, Debug)]
pub struct SimulationYears {
    pub base_yr: u32,
    pub curr_yr: u32,
    pub end_yr: u32,
}
