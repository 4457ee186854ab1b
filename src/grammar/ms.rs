// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Compatibility shim for ms-style command lines (Hudson's `ms`).
//!
//! A command beginning with `-I` is translated into the extended
//! grammar: one ms time or size unit corresponds to `2 * n_ref`
//! generations or diploids, growth rates are divided by `2 * n_ref`,
//! and the 1-based ms population labels shift to 0-based. ms numbers
//! the populations created by `-es` in time order, so events are sorted
//! by time before emission; the extended `-S` string-order numbering
//! then coincides with it.

use ordered_float::NotNan;

use crate::errors::{Error, Result};
use crate::grammar::{build, tokenize, Flag, Params};
use crate::model::demography::Demography;

pub(crate) fn parse_ms(n_ref: f64, ms_cmd: &str, params: &Params) -> Result<Demography> {
    let flags = tokenize(ms_cmd)?;
    if flags.is_empty() || flags[0].name != "I" {
        return Err(Error::MissingMsPreamble);
    }
    let scale = 2.0 * n_ref;

    let preamble = &flags[0];
    if preamble.args.is_empty() {
        return Err(Error::InvalidFlagArity {
            flag: "I".into(),
            expected: 2,
            got: 0,
        });
    }
    let npop = ms_int(params, &preamble.args[0])?;
    let samples = &preamble.args[1..];
    if samples.len() != npop {
        // a trailing argument to -I is the symmetric migration rate
        return Err(Error::MigrationNotImplemented { flag: "I".into() });
    }
    let samples = samples
        .iter()
        .map(|tok| ms_int(params, tok))
        .collect::<Result<Vec<usize>>>()?;

    let mut extended = vec![
        Flag::new("d", vec![fmt(scale)]),
        Flag::new(
            "n",
            samples.iter().map(|n| n.to_string()).collect(),
        ),
    ];
    let mut events: Vec<(f64, Flag)> = Vec::new();

    for flag in &flags[1..] {
        match flag.name.as_str() {
            // ms -a i t: leaf i is archaic, sampled t ago (same
            // extension as in the extended grammar, ms argument order)
            "a" => {
                flag.expect_arity(2)?;
                let i = ms_pop(params, &flag.args[0])?;
                let t = params.resolve(&flag.args[1])? * scale;
                extended.push(Flag::new("a", vec![fmt(t), i.to_string()]));
            }
            // present-day size and growth settings
            "n" => {
                flag.expect_arity(2)?;
                let i = ms_pop(params, &flag.args[0])?;
                let x = params.resolve(&flag.args[1])? * scale;
                events.push((0.0, Flag::new("N", vec![fmt(0.0), i.to_string(), fmt(x)])));
            }
            "g" => {
                flag.expect_arity(2)?;
                let i = ms_pop(params, &flag.args[0])?;
                let alpha = params.resolve(&flag.args[1])? / scale;
                events.push((0.0, Flag::new("G", vec![fmt(0.0), i.to_string(), fmt(alpha)])));
            }
            "G" => {
                flag.expect_arity(1)?;
                let alpha = params.resolve(&flag.args[0])? / scale;
                events.push((0.0, Flag::new("G", vec![fmt(0.0), "*".into(), fmt(alpha)])));
            }
            "en" => {
                flag.expect_arity(3)?;
                let t = params.resolve(&flag.args[0])? * scale;
                let i = ms_pop(params, &flag.args[1])?;
                let x = params.resolve(&flag.args[2])? * scale;
                events.push((t, Flag::new("N", vec![fmt(t), i.to_string(), fmt(x)])));
            }
            "eN" => {
                flag.expect_arity(2)?;
                let t = params.resolve(&flag.args[0])? * scale;
                let x = params.resolve(&flag.args[1])? * scale;
                events.push((t, Flag::new("N", vec![fmt(t), "*".into(), fmt(x)])));
            }
            "eg" => {
                flag.expect_arity(3)?;
                let t = params.resolve(&flag.args[0])? * scale;
                let i = ms_pop(params, &flag.args[1])?;
                let alpha = params.resolve(&flag.args[2])? / scale;
                events.push((t, Flag::new("G", vec![fmt(t), i.to_string(), fmt(alpha)])));
            }
            "eG" => {
                flag.expect_arity(2)?;
                let t = params.resolve(&flag.args[0])? * scale;
                let alpha = params.resolve(&flag.args[1])? / scale;
                events.push((t, Flag::new("G", vec![fmt(t), "*".into(), fmt(alpha)])));
            }
            "ej" => {
                flag.expect_arity(3)?;
                let t = params.resolve(&flag.args[0])? * scale;
                let i = ms_pop(params, &flag.args[1])?;
                let j = ms_pop(params, &flag.args[2])?;
                events.push((
                    t,
                    Flag::new("J", vec![fmt(t), i.to_string(), j.to_string()]),
                ));
            }
            "es" => {
                flag.expect_arity(3)?;
                let t = params.resolve(&flag.args[0])? * scale;
                let i = ms_pop(params, &flag.args[1])?;
                let p = params.resolve(&flag.args[2])?;
                events.push((t, Flag::new("S", vec![fmt(t), i.to_string(), fmt(p)])));
            }
            "m" | "ma" | "em" | "ema" | "eM" | "eM0" => {
                return Err(Error::MigrationNotImplemented {
                    flag: flag.name.clone(),
                })
            }
            _ => {
                return Err(Error::InvalidFlag {
                    flag: flag.name.clone(),
                })
            }
        }
    }

    events.sort_by_key(|&(t, _)| NotNan::new(t).unwrap());
    extended.extend(events.into_iter().map(|(_, flag)| flag));
    build(&extended, &Params::default())
}

fn fmt(value: f64) -> String {
    format!("{}", value)
}

fn ms_int(params: &Params, token: &str) -> Result<usize> {
    let value = params.resolve(token)?;
    if value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(Error::InvalidLiteral {
            literal: token.to_owned(),
        });
    }
    Ok(value as usize)
}

/// 1-based ms population label, shifted to the 0-based extended labels.
fn ms_pop(params: &Params, token: &str) -> Result<usize> {
    let label = ms_int(params, token)?;
    if label < 1 {
        return Err(Error::InvalidLiteral {
            literal: token.to_owned(),
        });
    }
    Ok(label - 1)
}
