// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use termcolor::{Color, ColorSpec, WriteColor};

use crate::config::Config;
use crate::plan::{self, AddressPlan, Unit};
use crate::template::LinkerTemplate;

/// Outcome of one unit's build.
#[derive(Clone, Debug)]
pub struct UnitReport {
    pub address: u64,
    pub ok: bool,
}

/// Builds every unit in order, patching the template with each unit's
/// address and restoring it afterward.
///
/// A unit whose build fails is recorded and the sequence continues; the
/// accumulated failures are reported as a single error at the end.  I/O
/// failures around the template itself abort immediately (after the guard
/// has restored the original content).
pub fn run(
    verbose: bool,
    cfg_path: &Path,
    units_filter: Option<Vec<String>>,
) -> Result<()> {
    let cfg = Config::from_file(cfg_path)?;
    let units = plan::discover(&cfg.units_dir)?;

    let to_build: Option<BTreeSet<&str>> = match &units_filter {
        Some(filter) => {
            check_unit_names(&units, filter)?;
            Some(filter.iter().map(|n| n.as_str()).collect())
        }
        None => None,
    };

    let plan = AddressPlan::new(&cfg);
    plan.check_fit(units.len())?;

    if units.is_empty() {
        println!("no units in {}", cfg.units_dir.display());
        return Ok(());
    }

    check_rebuild(&cfg)?;

    let template = LinkerTemplate::load(&cfg.template)?;

    let color_choice = if atty::is(atty::Stream::Stdout) {
        termcolor::ColorChoice::Auto
    } else {
        termcolor::ColorChoice::Never
    };
    let mut out = termcolor::StandardStream::stdout(color_choice);

    let mut reports: IndexMap<String, UnitReport> = IndexMap::new();
    for (index, unit) in units.iter().enumerate() {
        if let Some(filter) = &to_build {
            if !filter.contains(unit.name.as_str()) {
                continue;
            }
        }

        // Index into the full sorted list, not the filtered one, so that a
        // partial build places units exactly where a full build would.
        let address = plan.address(index)?;

        let guard = template.patch(cfg.base_address, address)?;
        let ok = build_unit(&cfg, unit, address, verbose)?;

        write!(out, "unit {:<24} {:#010x} ", unit.name, address)?;
        let mut color = ColorSpec::new();
        color.set_fg(Some(if ok { Color::Green } else { Color::Red }));
        out.set_color(&color)?;
        write!(out, "{}", if ok { "ok" } else { "failed" })?;
        out.reset()?;
        writeln!(out)?;

        guard.restore()?;
        reports.insert(unit.name.clone(), UnitReport { address, ok });
    }

    let failed: Vec<String> = reports
        .iter()
        .filter(|(_, r)| !r.ok)
        .map(|(name, r)| format!("{} ({:#x})", name, r.address))
        .collect();
    if !failed.is_empty() {
        bail!(
            "{} of {} units failed to build: {}",
            failed.len(),
            reports.len(),
            failed.join(", ")
        );
    }

    println!("built {} units", reports.len());
    Ok(())
}

/// Prints the address assignment for each unit, without building.
pub fn print_plan(cfg_path: &Path) -> Result<()> {
    let cfg = Config::from_file(cfg_path)?;
    let units = plan::discover(&cfg.units_dir)?;
    let plan = AddressPlan::new(&cfg);
    plan.check_fit(units.len())?;

    println!("{:<5} {:<24} {:<24} ADDRESS", "INDEX", "UNIT", "FILE");
    for (index, unit) in units.iter().enumerate() {
        println!(
            "{:<5} {:<24} {:<24} {:#010x}",
            index,
            unit.name,
            unit.file_name,
            plan.address(index)?
        );
    }

    if let Some(size) = cfg.region_size {
        let used = cfg.step * units.len() as u64;
        let percent = used * 100 / size;
        println!(
            "region: {:#x} of {:#x} allocated ({}%)",
            used, size, percent
        );
    }
    Ok(())
}

/// Invokes cargo for one unit, synchronously.  Returns whether the build
/// succeeded; failure to launch cargo at all is an error.
fn build_unit(
    cfg: &Config,
    unit: &Unit,
    address: u64,
    verbose: bool,
) -> Result<bool> {
    println!("building unit {} at {:#x}", unit.name, address);

    let build_config = cfg.unit_build_config(&unit.name, address, verbose);
    let mut cmd = build_config.cmd("build");
    let status = cmd
        .status()
        .context(format!("failed to run cargo ({:?})", cmd))?;
    Ok(status.success())
}

/// Checks the buildstamp file and runs `cargo clean` if invalid.
///
/// Cargo does not track the linker template as a build input, so a unit
/// whose source is unchanged would not be relinked after a configuration
/// change; cleaning forces the issue.
fn check_rebuild(cfg: &Config) -> Result<()> {
    let buildstamp_file = cfg.crate_dir.join("target").join("buildstamp");
    let rebuild = match std::fs::read(&buildstamp_file) {
        Ok(contents) => {
            if let Ok(contents) = std::str::from_utf8(&contents) {
                if let Ok(cmp) = u64::from_str_radix(contents, 16) {
                    cfg.buildhash != cmp
                } else {
                    println!("buildstamp file contents unknown; re-building.");
                    true
                }
            } else {
                println!("buildstamp file contents corrupt; re-building.");
                true
            }
        }
        Err(_) => {
            println!("no buildstamp file found; re-building.");
            true
        }
    };

    if rebuild {
        println!("configuration has changed; rebuilding all units");
        let mut cmd = Command::new("cargo");
        cmd.arg("clean");
        cmd.current_dir(&cfg.crate_dir);
        let status = cmd
            .status()
            .context(format!("failed to run cargo ({:?})", cmd))?;
        if !status.success() {
            bail!("cargo clean failed, see output for details");
        }
    }

    // now that we're clean, update our buildstamp file; any failure to
    // build from here on need not trigger a clean
    if let Some(parent) = buildstamp_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&buildstamp_file, format!("{:x}", cfg.buildhash))?;

    Ok(())
}

fn check_unit_names(units: &[Unit], filter: &[String]) -> Result<()> {
    let known: BTreeSet<&str> = units.iter().map(|u| u.name.as_str()).collect();
    if let Some(name) = filter.iter().find(|n| !known.contains(n.as_str())) {
        bail!(unit_name_suggestion(name, units));
    }
    Ok(())
}

fn unit_name_suggestion(name: &str, units: &[Unit]) -> String {
    // Suggest only for very small differences
    // High number can result in inaccurate suggestions for short queries
    const MAX_DISTANCE: usize = 3;

    let mut scored: Vec<_> = units
        .iter()
        .filter_map(|u| {
            let distance = strsim::damerau_levenshtein(name, &u.name);
            if distance <= MAX_DISTANCE {
                Some((distance, u.name.as_str()))
            } else {
                None
            }
        })
        .collect();
    scored.sort();
    let mut out = format!("'{}' is not a valid unit name.", name);
    if let Some((_, s)) = scored.first() {
        out.push_str(&format!(" Did you mean '{}'?", s));
    }
    out
}
