//! Glob-based selection of experiment names.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).with_context(|| format!("invalid pattern '{pattern}'"))?;
        builder.add(glob);
    }
    builder.build().context("build pattern set")
}

/// Select names matching at least one include glob and no exclude glob.
pub fn select_by_pattern<I, S>(names: I, include: &[String], exclude: &[String]) -> Result<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let include = build_globset(include)?;
    let exclude = build_globset(exclude)?;
    Ok(names
        .into_iter()
        .filter(|name| {
            let name = name.as_ref();
            include.is_match(name) && !exclude.is_match(name)
        })
        .map(|name| name.as_ref().to_string())
        .collect())
}
