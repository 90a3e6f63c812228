//! pd-runtime: the bytecode interpreter for compiled Palladium chunks.
//!
//! - [`vm`]: the stack machine itself.
//! - [`builtins`]: the `stl` struct and its native functions.
//! - [`value_display`]: how a `Value` renders for `print`/`tostr`.
//! - [`debug`]: the bytecode disassembler.
//! - [`error`]: `RuntimeError`, the single error type `Vm::run` can fail with.

pub mod builtins;
pub mod debug;
pub mod error;
pub mod value_display;
pub mod vm;

pub use error::RuntimeError;
pub use vm::{Vm, VmResult};
