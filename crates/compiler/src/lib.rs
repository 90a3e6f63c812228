//! pd-compiler: scans and compiles Palladium source into a top-level
//! [`pd_core::Chunk`] in one pass.
//!
//! - [`scanner`]: hand-written lexer.
//! - [`compiler`]: the Pratt parser/code generator.
//! - [`types`]: the compile-time type stack and native-global signatures.
//! - [`config`]: the extension seam a host registers native globals through.
//! - [`error`]: `CompileError`, the error type `compile` can fail with.

pub mod compiler;
pub mod config;
pub mod error;
pub mod scanner;
pub mod types;

pub use compiler::{compile, CompileArtifact};
pub use config::CompilerConfig;
pub use error::CompileError;
pub use types::{Signature, TypeStack};
