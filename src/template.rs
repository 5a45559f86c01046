// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The shared linker-script template.  Loading retains the original text,
/// so the file can be restored to its exact prior bytes after each unit's
/// patched build.
pub struct LinkerTemplate {
    path: PathBuf,
    original: String,
}

impl LinkerTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        let original = std::fs::read_to_string(path).with_context(|| {
            format!("could not read template {}", path.display())
        })?;
        Ok(LinkerTemplate {
            path: path.to_path_buf(),
            original,
        })
    }

    /// Overwrites the template with a copy in which every occurrence of
    /// `from` (rendered `{:#x}`) is replaced by `to`.  Nothing else in the
    /// file changes.
    ///
    /// The returned guard writes the original content back when dropped;
    /// call [`PatchGuard::restore`] instead to observe the I/O result.
    pub fn patch(&self, from: u64, to: u64) -> Result<PatchGuard<'_>> {
        let needle = format!("{:#x}", from);
        let replacement = format!("{:#x}", to);
        if !self.original.contains(&needle) {
            log::warn!(
                "{} contains no occurrence of {}; the build for {} will use \
                 the template as-is",
                self.path.display(),
                needle,
                replacement
            );
        }
        let patched = self.original.replace(&needle, &replacement);
        std::fs::write(&self.path, &patched).with_context(|| {
            format!("could not write patched template {}", self.path.display())
        })?;
        Ok(PatchGuard {
            template: self,
            armed: true,
        })
    }

    fn write_original(&self) -> Result<()> {
        std::fs::write(&self.path, &self.original).with_context(|| {
            format!("could not restore template {}", self.path.display())
        })
    }
}

/// Scoped restoration of a patched template.
///
/// The guard restores on every exit path: explicitly via `restore`, or in
/// `Drop` if the caller bails out early or panics.  A process killed
/// between patch and restore still leaves the file patched; that window
/// cannot be closed from inside the process.
pub struct PatchGuard<'a> {
    template: &'a LinkerTemplate,
    armed: bool,
}

impl PatchGuard<'_> {
    /// Restores the original template content, reporting any I/O failure.
    pub fn restore(mut self) -> Result<()> {
        self.armed = false;
        self.template.write_original()
    }
}

impl Drop for PatchGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.template.write_original() {
                log::error!("{:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const LINKER: &str = indoc! {r#"
        OUTPUT_ARCH(riscv)
        ENTRY(_start)
        BASE_ADDRESS = 0x80400000;

        SECTIONS
        {
            . = 0x80400000;
        }
    "#};

    fn template_file(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linker.ld");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn patch_replaces_every_occurrence() {
        let (_dir, path) = template_file(LINKER);
        let template = LinkerTemplate::load(&path).unwrap();

        let guard = template.patch(0x8040_0000, 0x8042_0000).unwrap();
        let patched = std::fs::read_to_string(&path).unwrap();
        assert_eq!(patched.matches("0x80420000").count(), 2);
        assert!(!patched.contains("0x80400000"));
        // Only the literal changed.
        assert_eq!(
            patched.replace("0x80420000", "0x80400000"),
            LINKER
        );

        guard.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), LINKER);
    }

    #[test]
    fn drop_restores_original() {
        let (_dir, path) = template_file(LINKER);
        let template = LinkerTemplate::load(&path).unwrap();
        {
            let _guard = template.patch(0x8040_0000, 0x8046_0000).unwrap();
            assert!(std::fs::read_to_string(&path)
                .unwrap()
                .contains("0x80460000"));
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), LINKER);
    }

    #[test]
    fn missing_literal_leaves_content_unchanged() {
        let (_dir, path) = template_file("SECTIONS { . = 0x10000000; }\n");
        let template = LinkerTemplate::load(&path).unwrap();
        let guard = template.patch(0x8040_0000, 0x8042_0000).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "SECTIONS { . = 0x10000000; }\n"
        );
        guard.restore().unwrap();
    }

    #[test]
    fn load_of_missing_template_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LinkerTemplate::load(&dir.path().join("nope.ld")).is_err());
    }
}
