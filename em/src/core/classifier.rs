//! Deterministic classification of changed paths by tracked extension.

use std::collections::BTreeSet;
use std::path::Path;

/// Changed paths split by whether their extension is tracked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    /// True if anything at all changed in the working tree.
    pub has_changes: bool,
    /// Tracked extensions that occur among the changed paths (sorted).
    pub changed_exts: BTreeSet<String>,
}

impl ChangeSummary {
    /// True iff some changed path has a tracked extension.
    pub fn has_source_changes(&self) -> bool {
        !self.changed_exts.is_empty()
    }

    /// Pathspecs (`*.ext`) that stage exactly the tracked kinds that changed.
    pub fn pathspecs(&self) -> Vec<String> {
        self.changed_exts
            .iter()
            .map(|ext| format!("*.{ext}"))
            .collect()
    }
}

/// Extension of the file name, without the dot. Dotfiles such as `.bashrc`
/// have no extension.
pub fn extension_of(path: &str) -> Option<&str> {
    Path::new(path).extension().and_then(|ext| ext.to_str())
}

pub fn classify_changed_paths<P: AsRef<str>>(changed: &[P], tracked: &[String]) -> ChangeSummary {
    let mut summary = ChangeSummary {
        has_changes: !changed.is_empty(),
        changed_exts: BTreeSet::new(),
    };
    for path in changed {
        if let Some(ext) = extension_of(path.as_ref())
            && tracked.iter().any(|t| t == ext)
        {
            summary.changed_exts.insert(ext.to_string());
        }
    }
    summary
}
