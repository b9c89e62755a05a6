//! zerg — polymorphic code mutator for x86 (32-bit) PE binaries.
//!
//! Disassembles a PE image's entry code section, rewrites every instruction
//! into a semantically equivalent but byte-different form, lays the result
//! out into a new section, and patches every pointer class in the image
//! (relocations, exports, SafeSEH handlers, TLS callbacks, the entry point)
//! against the rewritten addresses. See [`engine::Engine`] for the core
//! mutation pipeline and [`pe::mutate_file`] for the end-to-end driver.

pub mod decoder;
pub mod engine;
pub mod error;
pub mod graph;
pub mod mutate;
pub mod pe;

pub use engine::{Engine, MutationOutput, RvaMap};
pub use error::ZergError;
pub use mutate::polymorphic::{MutationConfig, PolymorphicMutation};
pub use mutate::{IdentityMutation, MutationImpl};
