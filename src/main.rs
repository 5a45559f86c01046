// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::Result;
use structopt::StructOpt;

mod config;
mod plan;
mod run;
mod template;

#[derive(Debug, StructOpt)]
#[structopt(
    max_term_width = 80,
    about = "builds a collection of binaries at staggered base addresses, \
             patching a shared linker template for each one"
)]
enum Stagger {
    /// Builds every unit found in the units directory, in lexicographic
    /// order, rewriting the linker template's base-address literal to each
    /// unit's assigned address and restoring the template afterward.
    Build {
        /// Request verbosity from tools we shell out to.
        #[structopt(short)]
        verbose: bool,
        /// Path to the configuration file, in TOML.
        cfg: PathBuf,
        /// Names of specific units to build. Addresses are still assigned
        /// by position in the full sorted unit list, so a partial build
        /// places units exactly where a full build would.
        units: Vec<String>,
    },

    /// Prints the address each unit would be assigned, without building
    /// anything or touching the template.
    Plan {
        /// Path to the configuration file, in TOML.
        cfg: PathBuf,
    },
}

fn main() -> Result<()> {
    let env = env_logger::Env::default().filter_or("RUST_LOG", "info");

    env_logger::init_from_env(env);

    match Stagger::from_args() {
        Stagger::Build {
            verbose,
            cfg,
            units,
        } => {
            let units = if units.is_empty() { None } else { Some(units) };
            run::run(verbose, &cfg, units)?;
        }
        Stagger::Plan { cfg } => {
            run::print_plan(&cfg)?;
        }
    }

    Ok(())
}
