// ABOUTME: Catalog snapshot builder - maps storage file identifiers to relation metadata
// ABOUTME: Pluggable catalog source; the CLI loads a serde-JSON snapshot file

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::reltype::{AccessMethod, RelKind};

/// Persistence level of a catalog relation. Only permanent relations are
/// replicated; unlogged and temporary ones never reach the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelPersistence {
    Permanent,
    Unlogged,
    Temp,
}

/// One relation row from the catalog scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRow {
    pub oid: u64,
    pub relname: String,
    /// Physical storage identifier. Zero means the relation uses the
    /// shared relation map and must be resolved through it.
    #[serde(default)]
    pub relfilenode: u64,
    pub relam: AccessMethod,
    pub relkind: RelKind,
    #[serde(default = "default_persistence")]
    pub relpersistence: RelPersistence,
    #[serde(default)]
    pub relisshared: bool,
}

fn default_persistence() -> RelPersistence {
    RelPersistence::Permanent
}

/// Source of catalog rows and relation-map indirections.
///
/// The production implementation reads a snapshot file; tests supply
/// in-memory fixtures.
pub trait CatalogSource {
    /// One full scan over the relation catalog, taken under a shared lock
    /// by whoever produced the snapshot.
    fn scan_class_rows(&self) -> Result<Vec<CatalogRow>>;

    /// Resolve a mapped relation's true storage identifier.
    fn map_oid_to_filenode(&self, oid: u64, shared: bool) -> Option<u64>;
}

/// One physical storage object known from the catalog at snapshot time.
///
/// `segments` starts empty and collects the numbered segment suffixes
/// observed while walking the primary directory; the mirror pass reads
/// it back to spot segments that exist only on the mirror.
#[derive(Debug, Clone)]
pub struct RelfilenodeEntry {
    pub relfilenode: u64,
    pub relam: AccessMethod,
    pub relkind: RelKind,
    pub relname: String,
    pub segments: Vec<u32>,
}

/// Build the storage-identifier map from one catalog scan.
///
/// Views and composite types have no storage and are skipped, as are
/// unlogged relations (they are not replicated and must never be flagged
/// as missing or mismatched). Mapped relations are resolved to their
/// physical identifier first. Duplicate physical identifiers are not
/// expected; if one appears the last row wins silently, which is
/// acceptable since only one distinct object should ever map to a key.
pub fn build_relfilenode_map(
    source: &dyn CatalogSource,
) -> Result<HashMap<u64, RelfilenodeEntry>> {
    let mut map = HashMap::new();

    for row in source.scan_class_rows()? {
        if row.relkind == RelKind::View || row.relkind == RelKind::CompositeType {
            continue;
        }

        // Unlogged relations do not propagate to replica servers.
        if row.relpersistence != RelPersistence::Permanent {
            continue;
        }

        let relfilenode = if row.relfilenode == 0 {
            match source.map_oid_to_filenode(row.oid, row.relisshared) {
                Some(node) => node,
                None => {
                    tracing::debug!(
                        oid = row.oid,
                        relname = %row.relname,
                        "mapped relation has no relation map entry, skipping"
                    );
                    continue;
                }
            }
        } else {
            row.relfilenode
        };

        map.insert(
            relfilenode,
            RelfilenodeEntry {
                relfilenode,
                relam: row.relam,
                relkind: row.relkind,
                relname: row.relname,
                segments: Vec::new(),
            },
        );
    }

    Ok(map)
}

/// Catalog snapshot loaded from a JSON file.
///
/// The file is produced externally (a catalog query run on the primary
/// under a shared lock) and holds the class rows plus the relation-map
/// table for mapped system relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonCatalog {
    pub rows: Vec<CatalogRow>,
    #[serde(default)]
    pub relmap: Vec<RelmapEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelmapEntry {
    pub oid: u64,
    #[serde(default)]
    pub shared: bool,
    pub relfilenode: u64,
}

impl JsonCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("failed to open catalog snapshot {}", path.display()))?;
        let catalog = serde_json::from_reader(file)
            .with_context(|| format!("failed to parse catalog snapshot {}", path.display()))?;
        Ok(catalog)
    }
}

impl CatalogSource for JsonCatalog {
    fn scan_class_rows(&self) -> Result<Vec<CatalogRow>> {
        Ok(self.rows.clone())
    }

    fn map_oid_to_filenode(&self, oid: u64, shared: bool) -> Option<u64> {
        self.relmap
            .iter()
            .find(|entry| entry.oid == oid && entry.shared == shared)
            .map(|entry| entry.relfilenode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(oid: u64, name: &str, relfilenode: u64) -> CatalogRow {
        CatalogRow {
            oid,
            relname: name.to_string(),
            relfilenode,
            relam: AccessMethod::Heap,
            relkind: RelKind::Relation,
            relpersistence: RelPersistence::Permanent,
            relisshared: false,
        }
    }

    #[test]
    fn builds_map_keyed_by_relfilenode() {
        let catalog = JsonCatalog {
            rows: vec![row(1, "users", 16384), row(2, "orders", 16390)],
            relmap: vec![],
        };

        let map = build_relfilenode_map(&catalog).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&16384].relname, "users");
        assert_eq!(map[&16390].relname, "orders");
        assert!(map[&16384].segments.is_empty());
    }

    #[test]
    fn skips_views_and_composite_types() {
        let mut view = row(1, "v_users", 16400);
        view.relkind = RelKind::View;
        let mut composite = row(2, "ctype", 16401);
        composite.relkind = RelKind::CompositeType;

        let catalog = JsonCatalog {
            rows: vec![view, composite, row(3, "users", 16402)],
            relmap: vec![],
        };

        let map = build_relfilenode_map(&catalog).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&16402));
    }

    #[test]
    fn skips_unlogged_relations() {
        let mut unlogged = row(1, "scratch", 16410);
        unlogged.relpersistence = RelPersistence::Unlogged;

        let catalog = JsonCatalog {
            rows: vec![unlogged, row(2, "users", 16411)],
            relmap: vec![],
        };

        let map = build_relfilenode_map(&catalog).unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&16411));
    }

    #[test]
    fn resolves_mapped_relations_through_relmap() {
        let mapped = row(1259, "pg_class_like", 0);
        let catalog = JsonCatalog {
            rows: vec![mapped],
            relmap: vec![RelmapEntry {
                oid: 1259,
                shared: false,
                relfilenode: 16500,
            }],
        };

        let map = build_relfilenode_map(&catalog).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&16500].relname, "pg_class_like");
    }

    #[test]
    fn mapped_relation_without_relmap_entry_is_skipped() {
        let catalog = JsonCatalog {
            rows: vec![row(99, "orphan_mapped", 0)],
            relmap: vec![],
        };

        let map = build_relfilenode_map(&catalog).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn duplicate_relfilenode_last_row_wins() {
        let catalog = JsonCatalog {
            rows: vec![row(1, "first", 16420), row(2, "second", 16420)],
            relmap: vec![],
        };

        let map = build_relfilenode_map(&catalog).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[&16420].relname, "second");
    }

    #[test]
    fn json_round_trip() {
        let catalog = JsonCatalog {
            rows: vec![row(1, "users", 16384)],
            relmap: vec![RelmapEntry {
                oid: 1259,
                shared: true,
                relfilenode: 16500,
            }],
        };
        let text = serde_json::to_string(&catalog).unwrap();
        let back: JsonCatalog = serde_json::from_str(&text).unwrap();
        assert_eq!(back.rows.len(), 1);
        assert_eq!(back.relmap.len(), 1);
        assert_eq!(back.rows[0].relname, "users");
    }
}
