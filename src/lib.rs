#![allow(clippy::too_many_arguments)]

pub mod core;
pub mod errors;
pub mod input;
pub mod model;

#[macro_use]
extern crate is_close;

pub use crate::errors::DemandError;
pub use crate::model::{Model, RegionResults, YearResults};
