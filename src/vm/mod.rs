// Veld Virtual Machine

pub mod heap;
pub mod modules;
pub mod natives;
pub mod table;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use heap::{Handle, Heap};
pub use value::Value;
pub use vm::Vm;
