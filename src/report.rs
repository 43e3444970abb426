// ABOUTME: Audit outcome and warning collection
// ABOUTME: Warnings are diagnostic findings; the boolean result is the contract

/// Kind of a soft finding raised during the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// A primary file whose identifier the catalog snapshot does not know.
    NotInCatalog,
    /// A file pair that still differed after the retry budget.
    Mismatch,
    /// A mirror file whose identifier the catalog snapshot does not know.
    ExtraOnMirror,
    /// A mirror segment file never seen during the primary walk.
    ExtraSegment,
}

/// One warning emitted during the audit. These are diagnostic only;
/// whether they affect the boolean result depends on the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditWarning {
    pub kind: WarningKind,
    pub message: String,
}

impl AuditWarning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Complete result of one audit invocation.
#[derive(Debug, Clone, Default)]
pub struct AuditOutcome {
    /// True when every compared file pair matched. Warnings about files
    /// missing from the catalog or extra on the mirror do not affect it.
    pub consistent: bool,
    pub files_compared: u64,
    pub files_mismatched: u64,
    pub warnings: Vec<AuditWarning>,
}

impl AuditOutcome {
    pub fn warnings_of_kind(&self, kind: WarningKind) -> impl Iterator<Item = &AuditWarning> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }

    /// Print a human-readable summary.
    pub fn print(&self) {
        println!();
        println!("Replica Consistency Check");
        println!("{}", "═".repeat(61));
        println!();
        println!("  Files compared:   {}", self.files_compared);
        println!("  Files mismatched: {}", self.files_mismatched);

        if !self.warnings.is_empty() {
            println!();
            println!("  Warnings:");
            for warning in &self.warnings {
                println!("    - {}", warning.message);
            }
        }

        println!();
        if self.consistent {
            println!("  Result: consistent");
        } else {
            println!("  Result: NOT consistent");
        }
        println!();
    }
}
