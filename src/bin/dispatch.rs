// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! `tasklet-dispatch`: a minimal process entry point wiring up tracing and
//! the [`tasklet::dispatch`] main loop from the command line.

use clap::Parser;
use tasklet::{dispatch, Config};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    let exit = dispatch(&config, None::<fn()>);
    std::process::exit(exit.code());
}
