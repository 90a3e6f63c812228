//! Data model shared by the Palladium compiler and runtime: values, heap
//! objects, the bytecode chunk format, and the hash table backing globals
//! and string interning.

pub mod chunk;
pub mod intern;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use intern::Interner;
pub use object::{BuiltinFn, BuiltinHost, BuiltinObj, FunctionObj, Heap, Object, StructObj, StructTemplateObj};
pub use table::{fnv1a_hash, Table};
pub use value::{Address, ObjHandle, PointeeTag, Value, ValueTag};
