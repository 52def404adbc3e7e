//! Logical error injection for a storage stack's block I/O path.
//!
//! Test code describes the errors it wants as records (an LBA range, a
//! set of RAID positions, an error type and an injection mode).  The
//! storage engine hands every block I/O to the engine, which corrupts the
//! in-flight sectors or fails the I/O when a record matches, and keeps
//! statistics the test can check afterwards.
//!
//! 1. **[`engine`]**: the [`InjectionEngine`] and its I/O types
//! 2. **[`store`]** / **[`record`]**: bounded record store and records
//! 3. **[`registry`]**: which objects and classes are enabled
//! 4. **[`sector`]**: how each error type rewrites a sector
//! 5. **[`events`]**: which event-log messages a detected error must produce
//! 6. **[`tables`]**: canned record sets
//!
//! # Architecture
//!
//! ```text
//! Test driver              Injection engine               RAID engine
//! ───────────              ────────────────               ───────────
//! create_record()  ──→ store (RwLock write)
//! enable_object()  ──→ registry
//!                      intercept()  ←── read lock ─── block I/O
//!                        ├─ match records
//!                        ├─ mode gating (atomics, RNG)
//!                        └─ corrupt sectors / status ──→ completion
//!                      validate_region() ←───────────── detected error
//! get_stats()      ←── counters
//! ```

pub mod engine;
pub mod error;
pub mod events;
pub mod record;
pub mod registry;
pub mod sector;
pub mod stats;
pub mod store;
pub mod tables;
pub mod types;
pub mod verified;

pub use engine::{EngineConfig, InjectionEngine, InjectionOutcome, IoRequest, IoStatus};
pub use error::{LeiError, Result};
pub use record::{ErrorRecord, RecordHandle};
pub use types::{BlockOpcode, ClassId, ErrorMode, ErrorType, ObjectId, PackageId, RaidKind};

#[cfg(test)]
mod scenario_tests;
