// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::process::exit;

use coalspec::cli::{run, Coalspec};
use structopt::StructOpt;

pub fn main() {
    let opt = Coalspec::from_args();

    // setup logger
    fern::Dispatch::new()
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr())
        .apply()
        .unwrap();

    exit(match run(opt) {
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
        _ => 0,
    })
}
