//! VMM Core (spec §4.3): device lifecycle, invariants, and status
//! derivation. Grounded on `distribution/src/service/mod.rs` and
//! `service/blob.rs` for the shape (plain async functions taking trait
//! objects and a few primitives, returning `Result<_, AppError>`), adapted
//! from repository-backed business logic to the VMM's container + KVS
//! orchestration.

pub mod session;
pub mod vmm;

pub use vmm::Vmm;
