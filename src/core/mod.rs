pub mod backup;
pub mod duplicate;
pub mod export;
pub mod hash;
pub mod library;
pub mod lock;
pub mod migration;
pub mod rollback;
pub mod workflow;

pub use backup::{BackupManifest, BackupStore};
pub use duplicate::{DuplicateIndex, DuplicateRelation};
pub use export::{ExportFormat, LowConfidenceExporter};
pub use hash::{DHash, Fingerprinter, HashEngine};
pub use library::{Component, LibraryDocument, LibraryStore};
pub use migration::{MigrationOptions, MigrationOrchestrator, MigrationReport};
pub use rollback::{Confirmer, RollbackEngine};
pub use workflow::{MigrateRequest, MigrationRun, migrate_library};
