// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{hash_map::DefaultHasher, BTreeMap};
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// A `RawConfig` represents an `app.toml` file that has been deserialized,
/// but may not be ready for use.  In particular, its paths are still
/// relative to the config file and the stride has not been validated.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    name: String,
    crate_dir: PathBuf,
    units_dir: PathBuf,
    template: PathBuf,
    base_address: u64,
    step: u64,
    region_size: Option<u64>,
    target: Option<String>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default = "default_release")]
    release: bool,
}

fn default_release() -> bool {
    true
}

#[derive(Clone, Debug)]
pub struct Config {
    pub name: String,
    pub crate_dir: PathBuf,
    pub units_dir: PathBuf,
    pub template: PathBuf,
    pub base_address: u64,
    pub step: u64,
    pub region_size: Option<u64>,
    pub target: Option<String>,
    pub features: Vec<String>,
    pub release: bool,
    pub buildhash: u64,
}

impl Config {
    pub fn from_file(cfg: &Path) -> Result<Self> {
        let cfg_contents = std::fs::read(cfg)
            .with_context(|| format!("could not read {}", cfg.display()))?;
        let toml: RawConfig = toml::from_slice(&cfg_contents)
            .with_context(|| format!("could not parse {}", cfg.display()))?;

        if toml.step == 0 {
            bail!("step must be nonzero; every unit would get the same address");
        }
        if toml.region_size == Some(0) {
            bail!("region-size must be nonzero; no unit would fit");
        }

        let mut hasher = DefaultHasher::new();
        hasher.write(&cfg_contents);
        let buildhash = hasher.finish();

        // Paths in the file are relative to the file itself.
        let base = cfg.parent().unwrap_or_else(|| Path::new("."));

        Ok(Config {
            name: toml.name,
            crate_dir: base.join(&toml.crate_dir),
            units_dir: base.join(&toml.units_dir),
            template: base.join(&toml.template),
            base_address: toml.base_address,
            step: toml.step,
            region_size: toml.region_size,
            target: toml.target,
            features: toml.features,
            release: toml.release,
            buildhash,
        })
    }

    /// Assembles the cargo invocation for one unit.
    ///
    /// The computed address also travels to the child build as an
    /// environment variable, so build scripts that can consume it directly
    /// don't have to rely on the patched template at all.
    pub fn unit_build_config(
        &self,
        unit_name: &str,
        address: u64,
        verbose: bool,
    ) -> BuildConfig {
        let mut args = vec!["--bin".to_string(), unit_name.to_string()];
        if self.release {
            args.push("--release".to_string());
        }
        if let Some(target) = &self.target {
            args.push("--target".to_string());
            args.push(target.to_string());
        }
        if !self.features.is_empty() {
            args.push("--features".to_string());
            args.push(self.features.join(","));
        }
        if verbose {
            args.push("-v".to_string());
        }

        let mut env = BTreeMap::new();
        env.insert("STAGGER_UNIT".to_string(), unit_name.to_string());
        env.insert(
            "STAGGER_UNIT_ADDRESS".to_string(),
            format!("{:#x}", address),
        );

        BuildConfig {
            args,
            env,
            crate_path: self.crate_dir.clone(),
        }
    }
}

/// Stores arguments and environment variables used to invoke cargo for a
/// particular unit.
pub struct BuildConfig {
    args: Vec<String>,
    env: BTreeMap<String, String>,
    pub crate_path: PathBuf,
}

impl BuildConfig {
    /// Applies the arguments and environment to a given Command
    pub fn cmd(&self, subcommand: &str) -> std::process::Command {
        // "cargo" carries no path component, so current_dir needs no
        // canonicalization here.
        let mut cmd = std::process::Command::new("cargo");
        cmd.arg(subcommand);
        for a in &self.args {
            cmd.arg(a);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.current_dir(&self.crate_path);
        cmd
    }
}
