pub mod commands;
pub mod engine;
pub mod printer;
pub mod repl;
