// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use structopt::StructOpt;

use crate::grammar::Params;
use crate::model::likelihood::compute_sfs_batch;
use crate::model::ConfigTable;
use crate::Demography;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "coalspec",
    about = "Expected site frequency spectra and allele configuration likelihoods under parametric demographies.",
    setting = structopt::clap::AppSettings::ColoredHelp,
)]
pub enum Coalspec {
    #[structopt(
        name = "evaluate",
        about = "Evaluate the expected number of segregating sites for each configuration of an allele-count table.",
        setting = structopt::clap::AppSettings::ColoredHelp,
    )]
    Evaluate {
        #[structopt(
            long = "demography",
            help = "Demography command string, e.g. '-d 10000 -n 2 2 -J 1000 1 0'."
        )]
        demography: String,
        #[structopt(
            long = "ms",
            help = "Interpret the demography as an ms command line (must start with -I)."
        )]
        ms: bool,
        #[structopt(
            long = "n-ref",
            help = "Reference diploid size for ms scaling (required with --ms)."
        )]
        n_ref: Option<f64>,
        #[structopt(
            long = "configs",
            parse(from_os_str),
            help = "JSON allele-count table ({\"populations\": [...], \"configs\": [[d0, d1, ...], ...]}); use - for STDIN."
        )]
        configs: PathBuf,
        #[structopt(
            long = "var",
            help = "Substitution variable for $-tokens, as name=value. May be given multiple times."
        )]
        vars: Vec<String>,
        #[structopt(
            long = "precision",
            default_value = "100",
            help = "Mantissa bits of the big-float coalescent kernels."
        )]
        precision: u32,
    },
}

pub fn run(opt: Coalspec) -> Result<()> {
    match opt {
        Coalspec::Evaluate {
            demography,
            ms,
            n_ref,
            configs,
            vars,
            precision,
        } => {
            crate::set_precision(precision);
            let params = parse_vars(&vars)?;
            let demography = if ms {
                let n_ref =
                    n_ref.context("--n-ref is required when parsing an ms command line")?;
                Demography::from_ms(n_ref, &demography, &params)?
            } else {
                Demography::from_cmd(&demography, &params)?
            };
            info!("evaluating against {}", demography);

            let table: ConfigTable = if configs == PathBuf::from("-") {
                let mut buf = String::new();
                io::stdin().read_to_string(&mut buf)?;
                serde_json::from_str(&buf)?
            } else {
                serde_json::from_reader(
                    File::open(&configs)
                        .with_context(|| format!("unable to read {}", configs.display()))?,
                )?
            };
            let site_configs = table.site_configs(&demography)?;
            let likelihoods = compute_sfs_batch(&demography, &site_configs)?;
            println!("{}", likelihoods.iter().join("\n"));
            Ok(())
        }
    }
}

fn parse_vars(vars: &[String]) -> Result<Params> {
    let mut params = Params::default();
    for var in vars {
        let mut split = var.splitn(2, '=');
        match (split.next(), split.next()) {
            (Some(name), Some(value)) => {
                params.insert(name, value.parse::<f64>()?);
            }
            _ => bail!("substitution variables must be given as name=value, got {:?}", var),
        }
    }
    Ok(params)
}
