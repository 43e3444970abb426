// ABOUTME: Relation classification and category selection
// ABOUTME: Maps (access method, relation kind) to a checkable category and include flag

use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// Storage access method of a relation, as recorded in the catalog
/// snapshot. `None` marks relations without a storage manager, such as
/// partitioned-table placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMethod {
    Btree,
    Hash,
    Gist,
    Gin,
    Bitmap,
    Heap,
    AoRow,
    AoColumn,
    None,
}

/// Relation kind, disambiguating access methods shared by several kinds
/// (sequences live in heap storage but are checked as their own category).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelKind {
    Relation,
    Sequence,
    Index,
    View,
    CompositeType,
    PartitionedTable,
}

/// The closed set of checkable relation categories.
///
/// The catch-all `Unknown` classifies relations whose access method the
/// auditor does not understand; it is checked only when the user asked
/// for `all` or named it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationCategory {
    Btree,
    Hash,
    Gist,
    Gin,
    Bitmap,
    Heap,
    Sequence,
    AppendOnly,
    Unknown,
}

/// All categories a user can select, in the order they are reported.
pub const NAMED_CATEGORIES: [RelationCategory; 8] = [
    RelationCategory::Btree,
    RelationCategory::Hash,
    RelationCategory::Gist,
    RelationCategory::Gin,
    RelationCategory::Bitmap,
    RelationCategory::Heap,
    RelationCategory::Sequence,
    RelationCategory::AppendOnly,
];

impl RelationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationCategory::Btree => "btree",
            RelationCategory::Hash => "hash",
            RelationCategory::Gist => "gist",
            RelationCategory::Gin => "gin",
            RelationCategory::Bitmap => "bitmap",
            RelationCategory::Heap => "heap",
            RelationCategory::Sequence => "sequence",
            RelationCategory::AppendOnly => "ao",
            RelationCategory::Unknown => "unknown relam",
        }
    }

    fn index(&self) -> usize {
        match self {
            RelationCategory::Btree => 0,
            RelationCategory::Hash => 1,
            RelationCategory::Gist => 2,
            RelationCategory::Gin => 3,
            RelationCategory::Bitmap => 4,
            RelationCategory::Heap => 5,
            RelationCategory::Sequence => 6,
            RelationCategory::AppendOnly => 7,
            RelationCategory::Unknown => 8,
        }
    }
}

impl std::fmt::Display for RelationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a relation into its checkable category.
///
/// Total over all inputs: heap storage splits into heap vs sequence on
/// the relation kind, both append-optimized orientations collapse into
/// "ao", and anything else falls into the `Unknown` catch-all.
pub fn classify(relam: AccessMethod, relkind: RelKind) -> RelationCategory {
    match relam {
        AccessMethod::Btree => RelationCategory::Btree,
        AccessMethod::Hash => RelationCategory::Hash,
        AccessMethod::Gist => RelationCategory::Gist,
        AccessMethod::Gin => RelationCategory::Gin,
        AccessMethod::Bitmap => RelationCategory::Bitmap,
        AccessMethod::Heap => {
            if relkind == RelKind::Sequence {
                RelationCategory::Sequence
            } else {
                RelationCategory::Heap
            }
        }
        AccessMethod::AoRow | AccessMethod::AoColumn => RelationCategory::AppendOnly,
        AccessMethod::None => RelationCategory::Unknown,
    }
}

/// The user's category selection, parsed once per invocation and threaded
/// through the auditor as an immutable value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorySelection {
    include: [bool; 9],
}

impl CategorySelection {
    /// Parses a comma-separated list of category tokens.
    ///
    /// Tokens are matched case-insensitively with surrounding whitespace
    /// trimmed. The special token `all` selects every category.
    /// Any unrecognized or empty token rejects the whole selection; no
    /// category is partially applied.
    pub fn parse(list: &str) -> Result<Self, AuditError> {
        let mut include = [false; 9];

        if list.trim().is_empty() {
            return Err(AuditError::InvalidParameter(
                "list syntax is invalid".to_string(),
            ));
        }

        for raw in list.split(',') {
            let tok = raw.trim();
            if tok.is_empty() {
                return Err(AuditError::InvalidParameter(
                    "list syntax is invalid".to_string(),
                ));
            }

            if tok.eq_ignore_ascii_case("all") {
                // "all" covers the catch-all too, so nothing on disk is
                // silently out of scope when everything was asked for.
                include = [true; 9];
                continue;
            }

            let mut found = false;
            for category in NAMED_CATEGORIES {
                if tok.eq_ignore_ascii_case(category.as_str()) {
                    include[category.index()] = true;
                    found = true;
                    break;
                }
            }
            if !found && tok.eq_ignore_ascii_case("unknown") {
                include[RelationCategory::Unknown.index()] = true;
                found = true;
            }

            if !found {
                return Err(AuditError::InvalidParameter(format!(
                    "unrecognized key word: \"{}\"",
                    tok
                )));
            }
        }

        Ok(Self { include })
    }

    /// Whether the given category was selected for checking.
    pub fn includes(&self, category: RelationCategory) -> bool {
        self.include[category.index()]
    }
}
