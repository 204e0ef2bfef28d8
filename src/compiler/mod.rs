// Veld Compiler

pub mod chunk;
pub mod compiler;
pub mod opcode;

pub use chunk::Chunk;
pub use compiler::compile;
pub use opcode::OpCode;
