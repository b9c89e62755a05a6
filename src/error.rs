//! Error types for the mutation pipeline.
//!
//! One kind per §7 of the design: I/O, PE parsing, instruction decode,
//! graph construction, and image fixup. `main` is the only place that turns
//! one of these into a process exit code; library code always returns
//! `Result`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZergError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PE image: {0}")]
    Parse(String),

    #[error("decode failed at RVA 0x{rva:X}: {reason}")]
    Decode { rva: u32, reason: String },

    #[error("graph error: {0}")]
    Graph(String),

    #[error("fixup error: {0}")]
    Fixup(String),
}
