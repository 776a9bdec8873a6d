//! Build, hash, sign, simulate and submit ERC-4337 UserOperations through an
//! EntryPoint's `handleOps`.

pub mod bindings;
pub mod builder;
pub mod config;
pub mod contracts;
pub mod encoding;
pub mod error;
pub mod hasher;
pub mod nonce;
pub mod packing;
pub mod pipeline;
pub mod preflight;
pub mod revert;
pub mod signer;
pub mod submitter;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ErrorKind, Result, UserOpError};
pub use pipeline::{PipelineConfig, RunOptions, RunOutcome, UserOpPipeline};
pub use types::{EntryPointVersion, Intent, UserOperation};
