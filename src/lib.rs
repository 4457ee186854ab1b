// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Expected site frequency spectra and allele-configuration likelihoods
//! under parametric demographies (splits, pulses, piecewise size
//! histories), computed with Hua Chen's coalescent sum-product
//! recursion (Chen 2012, Theoretical Population Biology).

#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate derive_new;
#[macro_use]
extern crate getset;
#[cfg(test)]
#[macro_use]
extern crate approx;

pub mod cli;
pub mod errors;
pub mod grammar;
pub mod model;
pub(crate) mod utils;

pub use crate::errors::{Error, Result};
pub use crate::grammar::Params;
pub use crate::model::demography::Demography;
pub use crate::model::kernels::{precision, set_precision};
pub use crate::model::likelihood::{compute_sfs, compute_sfs_batch, SumProduct};
pub use crate::model::{ConfigTable, SiteConfig};
