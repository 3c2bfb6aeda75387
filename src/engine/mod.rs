//! Everything that happens inside the sandbox: building, running, checking.

pub mod checker;
pub mod compiler;
pub mod executer;
pub mod sandbox;
