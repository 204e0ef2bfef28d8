// Veld Programming Language
// A fast, class-based bytecode interpreter

pub mod compiler;
pub mod error;
pub mod lexer;
pub mod vm;

pub use error::{VeldError, VeldResult};
pub use vm::{Value, Vm};
