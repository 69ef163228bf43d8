//! Install defaults from TOML drop-in files.
//!
//! Fragments named `*.toml` are read from `install.d` under `/usr/lib/bootslot`
//! and `/etc/bootslot`. A file in `/etc` replaces a file of the same name in
//! `/usr/lib`; the remaining fragments are merged in filename order.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

/// Directories searched for fragments, lowest precedence first.
const CONFIG_BASES: &[&str] = &["/usr/lib", "/etc"];
const CONFIG_SUBDIR: &str = "bootslot/install.d";

/// The toplevel of a fragment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct InstallConfigurationToplevel {
    pub(crate) install: Option<InstallConfiguration>,
}

/// The `[install]` table.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct InstallConfiguration {
    pub(crate) platform: Option<String>,
    pub(crate) arch: Option<String>,
    pub(crate) board: Option<String>,
    pub(crate) config_source: Option<String>,
    /// Appended to (not replacing) the arguments of earlier fragments.
    pub(crate) extra_kernel_args: Option<Vec<String>>,
}

impl InstallConfiguration {
    /// Apply a fragment of higher precedence on top of this one.
    fn merge(&mut self, other: Self) {
        fn set<T>(dest: &mut Option<T>, src: Option<T>) {
            if let Some(v) = src {
                *dest = Some(v);
            }
        }
        set(&mut self.platform, other.platform);
        set(&mut self.arch, other.arch);
        set(&mut self.board, other.board);
        set(&mut self.config_source, other.config_source);
        if let Some(args) = other.extra_kernel_args {
            self.extra_kernel_args
                .get_or_insert_with(Vec::new)
                .extend(args);
        }
    }
}

fn parse_fragment(path: &Utf8Path, contents: &str) -> Result<Option<InstallConfiguration>> {
    let c: InstallConfigurationToplevel =
        toml::from_str(contents).with_context(|| format!("Parsing {path}"))?;
    Ok(c.install)
}

/// Merge fragments in the order given.
fn merge_fragments<'a>(
    fragments: impl IntoIterator<Item = (&'a Utf8Path, &'a str)>,
) -> Result<Option<InstallConfiguration>> {
    let mut config: Option<InstallConfiguration> = None;
    for (path, contents) in fragments {
        let Some(c) = parse_fragment(path, contents)? else {
            tracing::debug!("{path} has no [install] table");
            continue;
        };
        tracing::debug!("merging install configuration from {path}");
        match config.as_mut() {
            Some(config) => config.merge(c),
            None => config = Some(c),
        }
    }
    Ok(config)
}

/// Load and merge the fragments found under `bases`.
pub(crate) fn load_config_from<P: AsRef<std::path::Path>>(
    bases: &[P],
) -> Result<Option<InstallConfiguration>> {
    let fragments = liboverdrop::scan(bases, CONFIG_SUBDIR, &["toml"], true);
    let mut loaded = Vec::new();
    for (_name, path) in fragments {
        let path = camino::Utf8PathBuf::try_from(path)?;
        let contents =
            std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        loaded.push((path, contents));
    }
    merge_fragments(loaded.iter().map(|(p, c)| (p.as_path(), c.as_str())))
}

/// Load the system install configuration, if any fragments exist.
#[context("Loading install configuration")]
pub(crate) fn load_config() -> Result<Option<InstallConfiguration>> {
    load_config_from(CONFIG_BASES)
}
