// ABOUTME: Directory auditor - walks primary and mirror data directories
// ABOUTME: Classifies each file, delegates to the block comparator, flags extras on the mirror

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::catalog::{build_relfilenode_map, CatalogSource, RelfilenodeEntry};
use crate::compare::FileComparator;
use crate::report::{AuditOutcome, AuditWarning, WarningKind};
use crate::reltype::{classify, AccessMethod, CategorySelection};
use crate::sync::{CancelToken, ReplicationControl, SyncGate, CHECKPOINT_SYNC_TIMEOUT_SECS};

/// Configuration for one audit invocation.
///
/// The audited subtrees are `<root>/base/<database_dir>` on each side:
/// only the default tablespace is scanned, a stated limitation of this
/// tool.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub primary_root: PathBuf,
    pub mirror_root: PathBuf,
    /// Name of the per-database subtree, identical on both sides.
    pub database_dir: String,
    pub selection: CategorySelection,
    pub sync_timeout: Duration,
}

impl AuditConfig {
    pub fn new(
        primary_root: impl Into<PathBuf>,
        mirror_root: impl Into<PathBuf>,
        database_dir: impl Into<String>,
        selection: CategorySelection,
    ) -> Self {
        Self {
            primary_root: primary_root.into(),
            mirror_root: mirror_root.into(),
            database_dir: database_dir.into(),
            selection,
            sync_timeout: Duration::from_secs(CHECKPOINT_SYNC_TIMEOUT_SECS),
        }
    }
}

/// Files that are permitted to diverge and are never replicated in full:
/// internal-prefix files, temporary tables, dotfiles, and the free-space
/// / visibility / init auxiliary forks.
pub fn should_skip(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    lower.starts_with("pg")
        || lower.starts_with("t_")
        || lower.starts_with('.')
        || lower.ends_with("_fsm")
        || lower.ends_with("_vm")
        || lower.ends_with("_init")
}

/// Parse `<relfilenode>` or `<relfilenode>.<segment>` from a data file
/// name. Returns `None` when the leading token is not numeric.
pub fn parse_relfilenode_name(filename: &str) -> Option<(u64, Option<u32>)> {
    let (node_part, seg_part) = match filename.split_once('.') {
        Some((node, seg)) => (node, Some(seg)),
        None => (filename, None),
    };

    let node = node_part.parse::<u64>().ok()?;
    let segment = match seg_part {
        Some(seg) => Some(seg.parse::<u32>().ok()?),
        None => None,
    };
    Some((node, segment))
}

/// Directory entries sorted by name, so repeated runs produce the same
/// comparison order and warning sequence.
fn sorted_file_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Walks the primary and mirror data directories and compares every
/// selected relation file pair through the block comparator.
pub struct ReplicaAuditor<'a> {
    config: AuditConfig,
    catalog: &'a dyn CatalogSource,
    control: &'a dyn ReplicationControl,
    cancel: CancelToken,
}

impl<'a> ReplicaAuditor<'a> {
    pub fn new(
        config: AuditConfig,
        catalog: &'a dyn CatalogSource,
        control: &'a dyn ReplicationControl,
    ) -> Self {
        Self {
            config,
            catalog,
            control,
            cancel: CancelToken::new(),
        }
    }

    /// Token callers can use to stop the walk from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the full audit: snapshot the catalog, compare every selected
    /// file pair under the primary tree, then re-walk the mirror tree
    /// for files the primary never produced.
    ///
    /// Always returns a definitive outcome once the walk starts; soft
    /// findings land in the outcome's warnings, and only cancellation or
    /// a failure to read the roots/catalog aborts.
    pub fn run(&self) -> Result<AuditOutcome> {
        let primary_dir = self
            .config
            .primary_root
            .join("base")
            .join(&self.config.database_dir);
        let mirror_dir = self
            .config
            .mirror_root
            .join("base")
            .join(&self.config.database_dir);

        // Checkpoint once up front so the first comparison attempt
        // already sees flushed data. The mirror may not have applied it
        // yet; the comparator's retry protocol converges on that.
        if let Err(err) = self.control.request_checkpoint() {
            tracing::warn!("initial checkpoint request failed: {:#}", err);
        }

        let mut map = build_relfilenode_map(self.catalog)?;

        let gate = SyncGate::new(self.control, self.cancel.clone())
            .with_timeout(self.config.sync_timeout);
        let comparator = FileComparator::new(&gate, &self.cancel);

        let mut outcome = AuditOutcome {
            consistent: true,
            ..AuditOutcome::default()
        };

        // Pass one: every eligible file under the primary is compared
        // against its mirror counterpart. The overall result is the AND
        // across all comparisons; nothing short-circuits.
        for name in sorted_file_names(&primary_dir)? {
            self.cancel.check()?;

            if should_skip(&name) {
                continue;
            }

            let Some((relfilenode, segment)) = parse_relfilenode_name(&name) else {
                warn_not_in_catalog(&mut outcome, &name);
                continue;
            };

            let Some(entry) = map.get_mut(&relfilenode) else {
                warn_not_in_catalog(&mut outcome, &name);
                continue;
            };

            // No storage manager (partitioned-table placeholder or
            // similar): nothing to compare.
            if entry.relam == AccessMethod::None {
                continue;
            }

            if !self
                .config
                .selection
                .includes(classify(entry.relam, entry.relkind))
            {
                continue;
            }

            if let Some(segment) = segment {
                entry.segments.push(segment);
            }

            let primary_path = primary_dir.join(&name);
            let mirror_path = mirror_dir.join(&name);

            let matched =
                comparator.compare_files(&primary_path, &mirror_path, entry, &mut outcome.warnings)?;
            outcome.files_compared += 1;
            if !matched {
                outcome.files_mismatched += 1;
            }
            outcome.consistent = outcome.consistent && matched;
        }

        // Pass two: anything on the mirror the primary walk cannot
        // account for. These are soft findings and do not flip the
        // boolean result.
        self.check_mirror_extras(&mirror_dir, &map, &mut outcome)?;

        Ok(outcome)
    }

    fn check_mirror_extras(
        &self,
        mirror_dir: &Path,
        map: &HashMap<u64, RelfilenodeEntry>,
        outcome: &mut AuditOutcome,
    ) -> Result<()> {
        for name in sorted_file_names(mirror_dir)? {
            self.cancel.check()?;

            if should_skip(&name) {
                continue;
            }

            let entry = parse_relfilenode_name(&name)
                .and_then(|(relfilenode, segment)| {
                    map.get(&relfilenode).map(|entry| (entry, segment))
                });

            match entry {
                Some((entry, Some(segment))) => {
                    let category = classify(entry.relam, entry.relkind);
                    if !entry.segments.contains(&segment) && self.config.selection.includes(category)
                    {
                        let message = format!(
                            "found extra {} file on mirror: {}",
                            category,
                            mirror_dir.join(&name).display()
                        );
                        tracing::warn!("{}", message);
                        outcome
                            .warnings
                            .push(AuditWarning::new(WarningKind::ExtraSegment, message));
                    }
                }
                Some((_, None)) => {
                    // Base file of a known relation; the primary walk
                    // covered it (or skipped it by selection).
                }
                None => {
                    let message = format!(
                        "found extra unknown file on mirror: {}",
                        mirror_dir.join(&name).display()
                    );
                    tracing::warn!("{}", message);
                    outcome
                        .warnings
                        .push(AuditWarning::new(WarningKind::ExtraOnMirror, message));
                }
            }
        }

        Ok(())
    }
}

fn warn_not_in_catalog(outcome: &mut AuditOutcome, name: &str) {
    let message = format!("relfilenode {} not present in primary's catalog", name);
    tracing::warn!("{}", message);
    outcome
        .warnings
        .push(AuditWarning::new(WarningKind::NotInCatalog, message));
}
