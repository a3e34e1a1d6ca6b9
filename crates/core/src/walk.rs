use std::collections::HashSet;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use crate::config::WalkOptions;
use crate::error::{RecoveryError, Result};
use crate::model::Handle;
use crate::provider::{ChildEntry, StorageProvider};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkedFile {
    pub handle: Handle,
    pub name: String,
    pub depth: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub files: u64,
    pub directories: u64,
    pub skipped: u64,
    pub cancelled: bool,
}

/// Depth-first traversal over a provider tree yielding leaf files only.
pub struct TreeWalker<'a> {
    provider: &'a dyn StorageProvider,
    max_depth: usize,
    excludes: ExcludeMatcher,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl<'a> TreeWalker<'a> {
    pub fn new(
        provider: &'a dyn StorageProvider,
        options: &WalkOptions,
        warnings: &mut Vec<String>,
    ) -> Self {
        Self {
            provider,
            max_depth: options.max_depth,
            excludes: ExcludeMatcher::new(&options.excludes, warnings),
            cancel_flag: None,
        }
    }

    pub fn with_cancel_flag(mut self, flag: Option<Arc<AtomicBool>>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Count pass: number of leaf files currently reachable from `root`.
    pub fn count(&self, root: &Handle, warnings: &mut Vec<String>) -> Result<u64> {
        let summary = self.traverse(root, warnings, &mut |_: WalkedFile| {})?;
        Ok(summary.files)
    }

    /// Yield pass: invokes `on_file` for every leaf file in depth-first order.
    pub fn walk<F>(
        &self,
        root: &Handle,
        warnings: &mut Vec<String>,
        mut on_file: F,
    ) -> Result<WalkSummary>
    where
        F: FnMut(WalkedFile),
    {
        self.traverse(root, warnings, &mut on_file)
    }

    fn traverse(
        &self,
        root: &Handle,
        warnings: &mut Vec<String>,
        on_file: &mut dyn FnMut(WalkedFile),
    ) -> Result<WalkSummary> {
        let mut summary = WalkSummary::default();
        let root_children =
            self.provider
                .list_children(root)
                .map_err(|err| RecoveryError::ProviderUnavailable {
                    root: root.clone(),
                    reason: err.to_string(),
                })?;

        let mut visited = HashSet::new();
        if let Some(id) = self.provider.node_id(root) {
            visited.insert(id);
        }

        let mut stack: Vec<(ChildEntry, usize)> = Vec::new();
        push_children(&mut stack, root_children, 1);

        while let Some((child, depth)) = stack.pop() {
            if self.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            if is_staging_artifact(&child.name) || self.excludes.is_excluded(&child) {
                debug!("excluded {}", child.handle);
                summary.skipped += 1;
                continue;
            }

            if !child.is_directory {
                summary.files += 1;
                on_file(WalkedFile {
                    handle: child.handle,
                    name: child.name,
                    depth,
                });
                continue;
            }

            if depth >= self.max_depth {
                warnings.push(format!(
                    "max depth {} reached at {}; not descending",
                    self.max_depth, child.handle
                ));
                summary.skipped += 1;
                continue;
            }

            if let Some(id) = self.provider.node_id(&child.handle) {
                if !visited.insert(id) {
                    warnings.push(format!(
                        "directory cycle detected at {}; already visited",
                        child.handle
                    ));
                    summary.skipped += 1;
                    continue;
                }
            }

            match self.provider.list_children(&child.handle) {
                Ok(children) => {
                    summary.directories += 1;
                    push_children(&mut stack, children, depth + 1);
                }
                Err(err) => {
                    warn!("listing failed for {}: {}", child.handle, err);
                    warnings.push(format!("listing failed for {}: {}", child.handle, err));
                    summary.skipped += 1;
                }
            }
        }

        Ok(summary)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

fn push_children(stack: &mut Vec<(ChildEntry, usize)>, children: Vec<ChildEntry>, depth: usize) {
    stack.extend(children.into_iter().rev().map(|child| (child, depth)));
}

fn is_staging_artifact(name: &str) -> bool {
    name.starts_with(".recovereasy-probe-")
        || (name.starts_with('.') && name.ends_with(crate::provider::STAGING_SUFFIX))
}

struct ExcludeMatcher {
    globset: Option<GlobSet>,
    substrings: Vec<String>,
}

impl ExcludeMatcher {
    fn new(patterns: &[String], warnings: &mut Vec<String>) -> Self {
        if patterns.is_empty() {
            return Self {
                globset: None,
                substrings: Vec::new(),
            };
        }

        let mut builder = GlobSetBuilder::new();
        let mut substrings = Vec::new();
        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }

            if is_plain_substring_pattern(pattern) {
                substrings.push(pattern.to_lowercase());
                continue;
            }

            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    warnings.push(format!(
                        "invalid exclude glob '{pattern}': {err}; using substring fallback."
                    ));
                    substrings.push(pattern.to_lowercase());
                }
            }
        }

        let globset = match builder.build() {
            Ok(set) => Some(set),
            Err(err) => {
                warnings.push(format!(
                    "failed to compile exclude glob set: {err}; glob excludes disabled."
                ));
                None
            }
        };

        Self {
            globset,
            substrings,
        }
    }

    fn is_excluded(&self, child: &ChildEntry) -> bool {
        if let Some(globset) = &self.globset {
            if globset.is_match(child.handle.as_str()) || globset.is_match(&child.name) {
                return true;
            }
        }

        if self.substrings.is_empty() {
            return false;
        }

        let lowered = child.handle.as_str().to_lowercase();
        self.substrings
            .iter()
            .any(|pattern| lowered.contains(pattern))
    }
}

fn is_plain_substring_pattern(pattern: &str) -> bool {
    !pattern
        .chars()
        .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'))
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Arc};

    use super::{TreeWalker, WalkedFile};
    use crate::config::WalkOptions;
    use crate::error::RecoveryError;
    use crate::model::Handle;
    use crate::provider::MemoryProvider;

    fn card() -> MemoryProvider {
        let provider = MemoryProvider::new();
        provider.add_file("/card/DCIM/100CANON/IMG_0001.JPG", vec![1]);
        provider.add_file("/card/DCIM/100CANON/IMG_0002.JPG", vec![2]);
        provider.add_file("/card/MISC/notes.txt", vec![3]);
        provider.add_file("/card/clip.mp4", vec![4]);
        provider
    }

    fn collect(walker: &TreeWalker<'_>, root: &str) -> (Vec<WalkedFile>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut files = Vec::new();
        walker
            .walk(&Handle::new(root), &mut warnings, |file| files.push(file))
            .expect("walk");
        (files, warnings)
    }

    #[test]
    fn yields_leaves_depth_first_in_listing_order() {
        let provider = card();
        let mut warnings = Vec::new();
        let walker = TreeWalker::new(&provider, &WalkOptions::default(), &mut warnings);
        let (files, _) = collect(&walker, "/card");

        let names = files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["IMG_0001.JPG", "IMG_0002.JPG", "notes.txt", "clip.mp4"]
        );
        assert_eq!(files[0].depth, 3);
        assert_eq!(
            walker.count(&Handle::new("/card"), &mut warnings).expect("count"),
            4
        );
    }

    #[test]
    fn directory_cycles_are_not_followed() {
        let provider = card();
        provider.add_dir_link("/card/DCIM/back", "/card");
        let mut warnings = Vec::new();
        let walker = TreeWalker::new(&provider, &WalkOptions::default(), &mut warnings);
        let (files, warnings) = collect(&walker, "/card");

        assert_eq!(files.len(), 4);
        assert!(warnings.iter().any(|w| w.contains("cycle")));
    }

    #[test]
    fn depth_bound_stops_descent() {
        let provider = card();
        let options = WalkOptions {
            max_depth: 2,
            ..WalkOptions::default()
        };
        let mut warnings = Vec::new();
        let walker = TreeWalker::new(&provider, &options, &mut warnings);
        let (files, warnings) = collect(&walker, "/card");

        let names = files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["notes.txt", "clip.mp4"]);
        assert!(warnings.iter().any(|w| w.contains("max depth")));
    }

    #[test]
    fn excludes_match_globs_and_substrings() {
        let provider = card();
        let options = WalkOptions {
            excludes: vec!["*.txt".to_string(), "100canon".to_string()],
            ..WalkOptions::default()
        };
        let mut warnings = Vec::new();
        let walker = TreeWalker::new(&provider, &options, &mut warnings);
        let (files, _) = collect(&walker, "/card");

        let names = files.iter().map(|f| f.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["clip.mp4"]);
    }

    #[test]
    fn missing_root_is_provider_unavailable() {
        let provider = card();
        let mut warnings = Vec::new();
        let walker = TreeWalker::new(&provider, &WalkOptions::default(), &mut warnings);
        let err = walker
            .walk(&Handle::new("/nowhere"), &mut warnings, |_| {})
            .expect_err("root missing");
        assert!(matches!(err, RecoveryError::ProviderUnavailable { .. }));
    }

    #[test]
    fn cancelled_walk_stops_early() {
        let provider = card();
        let flag = Arc::new(AtomicBool::new(true));
        let mut warnings = Vec::new();
        let walker = TreeWalker::new(&provider, &WalkOptions::default(), &mut warnings)
            .with_cancel_flag(Some(flag));
        let summary = walker
            .walk(&Handle::new("/card"), &mut warnings, |_| {})
            .expect("walk");
        assert!(summary.cancelled);
        assert_eq!(summary.files, 0);
    }
}
