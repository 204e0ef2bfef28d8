// Veld Lexer

pub mod scanner;
pub mod token;

pub use scanner::{Checkpoint, Scanner};
pub use token::{Token, TokenKind};
