// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

pub mod demography;
pub mod history;
pub mod kernels;
pub mod likelihood;

use crate::errors::{Error, Result};
use crate::model::demography::Demography;

/// Observed allele counts at one site: per leaf population, the number
/// of sampled lineages carrying the ancestral and the derived allele.
#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[get = "pub"]
pub struct SiteConfig {
    /// `(ancestral, derived)` per leaf, in leaf-label order
    counts: Vec<(u32, u32)>,
}

impl SiteConfig {
    /// Build a configuration from explicit `(ancestral, derived)` pairs.
    pub fn new(demography: &Demography, counts: Vec<(u32, u32)>) -> Result<Self> {
        let leaves = demography.leaves();
        if counts.len() != leaves.len() {
            return Err(Error::ConfigLength {
                expected: leaves.len(),
                got: counts.len(),
            });
        }
        for (leaf, (&(ancestral, derived), &pop)) in counts.iter().zip(leaves.iter()).enumerate() {
            let lineages = demography.lineages(pop);
            if ancestral + derived > lineages {
                return Err(Error::ConfigExceedsSample {
                    leaf,
                    ancestral,
                    derived,
                    lineages,
                });
            }
        }
        if counts.iter().map(|&(_, d)| d).sum::<u32>() == 0 {
            return Err(Error::ConfigNoDerived);
        }
        Ok(SiteConfig { counts })
    }

    /// Build a configuration from derived counts alone; every remaining
    /// sampled lineage carries the ancestral allele.
    pub fn from_derived(demography: &Demography, derived: &[u32]) -> Result<Self> {
        let leaves = demography.leaves();
        if derived.len() != leaves.len() {
            return Err(Error::ConfigLength {
                expected: leaves.len(),
                got: derived.len(),
            });
        }
        let counts = derived
            .iter()
            .zip(leaves.iter())
            .map(|(&d, &pop)| {
                let lineages = demography.lineages(pop);
                (lineages.saturating_sub(d), d)
            })
            .collect();
        Self::new(demography, counts)
    }
}

/// The batched allele-count table dumped by upstream tooling: one row of
/// derived counts per configuration, leaf populations in column order.
#[derive(Clone, Debug, Serialize, Deserialize, Getters, new)]
#[get = "pub"]
pub struct ConfigTable {
    #[serde(default)]
    populations: Vec<String>,
    configs: Vec<Vec<u32>>,
}

impl ConfigTable {
    pub fn site_configs(&self, demography: &Demography) -> Result<Vec<SiteConfig>> {
        self.configs
            .iter()
            .map(|row| SiteConfig::from_derived(demography, row))
            .collect()
    }
}
