// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use crate::config::Config;

/// One build unit, discovered from the units directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unit {
    /// Raw directory entry name; ordering is defined over this.
    pub file_name: String,
    /// Name passed to `cargo build --bin`: the part of the file name before
    /// the first `.`, or the whole file name if there is none.
    pub name: String,
}

impl Unit {
    fn from_file_name(file_name: String) -> Self {
        let name = match file_name.find('.') {
            Some(dot) => file_name[..dot].to_string(),
            None => file_name.clone(),
        };
        Unit { file_name, name }
    }
}

/// Enumerates the units directory, in lexicographic order of raw file
/// names.  Subdirectories are skipped; an empty directory is a valid
/// (no-op) plan.
pub fn discover(units_dir: &Path) -> Result<Vec<Unit>> {
    let entries = std::fs::read_dir(units_dir).with_context(|| {
        format!("could not list units in {}", units_dir.display())
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().into_string().map_err(|n| {
            anyhow!("unit file name {:?} is not valid UTF-8", n)
        })?;
        names.push(name);
    }
    names.sort();

    Ok(names.into_iter().map(Unit::from_file_name).collect())
}

/// Assigns each unit a base address, staggered by a fixed stride from the
/// start of the region.  Addresses are strictly increasing with index, so
/// they are pairwise distinct.
#[derive(Clone, Debug)]
pub struct AddressPlan {
    pub base_address: u64,
    pub step: u64,
    pub region_size: Option<u64>,
}

impl AddressPlan {
    pub fn new(cfg: &Config) -> Self {
        AddressPlan {
            base_address: cfg.base_address,
            step: cfg.step,
            region_size: cfg.region_size,
        }
    }

    /// Address for the unit at `index` in the sorted sequence.
    pub fn address(&self, index: usize) -> Result<u64> {
        self.step
            .checked_mul(index as u64)
            .and_then(|offset| self.base_address.checked_add(offset))
            .ok_or_else(|| {
                anyhow!("address overflow for unit at index {}", index)
            })
    }

    /// Checks that `count` units fit within the configured region, if one
    /// was configured.  Each unit is assumed to span one full stride.
    pub fn check_fit(&self, count: usize) -> Result<()> {
        let size = match self.region_size {
            Some(size) => size,
            None => return Ok(()),
        };
        if count == 0 {
            return Ok(());
        }
        let end = self
            .address(count - 1)?
            .checked_add(self.step)
            .ok_or_else(|| anyhow!("address overflow computing region end"))?;
        let region_end =
            self.base_address.checked_add(size).ok_or_else(|| {
                anyhow!(
                    "region {:#x}+{:#x} overflows the address space",
                    self.base_address,
                    size
                )
            })?;
        if end > region_end {
            bail!(
                "{} units at a {:#x} stride do not fit in the {:#x}-byte \
                 region at {:#x}",
                count,
                self.step,
                size,
                self.base_address
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(base_address: u64, step: u64, region_size: Option<u64>) -> AddressPlan {
        AddressPlan {
            base_address,
            step,
            region_size,
        }
    }

    #[test]
    fn addresses_are_staggered() {
        let p = plan(0x8040_0000, 0x2_0000, None);
        assert_eq!(p.address(0).unwrap(), 0x8040_0000);
        assert_eq!(p.address(1).unwrap(), 0x8042_0000);
        assert_eq!(p.address(5).unwrap(), 0x804a_0000);
    }

    #[test]
    fn addresses_are_distinct() {
        let p = plan(0x8040_0000, 0x2_0000, None);
        let addrs: Vec<u64> =
            (0..16).map(|i| p.address(i).unwrap()).collect();
        for w in addrs.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn address_overflow_is_an_error() {
        let p = plan(u64::MAX - 0x100, 0x2_0000, None);
        assert!(p.address(0).is_ok());
        assert!(p.address(1).is_err());
    }

    #[test]
    fn region_fit() {
        // Four strides of room: indices 0..=3 fit, 4 does not.
        let p = plan(0x8040_0000, 0x2_0000, Some(0x8_0000));
        assert!(p.check_fit(0).is_ok());
        assert!(p.check_fit(4).is_ok());
        let err = p.check_fit(5).unwrap_err();
        assert!(err.to_string().contains("do not fit"));
    }

    #[test]
    fn unit_name_strips_extension() {
        let u = Unit::from_file_name("app_a.rs".to_string());
        assert_eq!(u.name, "app_a");
        let u = Unit::from_file_name("hello.world.rs".to_string());
        assert_eq!(u.name, "hello");
    }

    #[test]
    fn unit_name_without_dot_is_kept_whole() {
        let u = Unit::from_file_name("makefile".to_string());
        assert_eq!(u.name, "makefile");
    }

    #[test]
    fn discovery_sorts_and_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app_b.rs"), "").unwrap();
        std::fs::write(dir.path().join("app_a.rs"), "").unwrap();
        std::fs::write(dir.path().join("app_c.rs"), "").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let units = discover(dir.path()).unwrap();
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["app_a", "app_b", "app_c"]);
    }

    #[test]
    fn discovery_of_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn discovery_of_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover(&dir.path().join("nope")).is_err());
    }
}
