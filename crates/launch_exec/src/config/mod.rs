//! Unit file configuration parsing and substitution

pub mod substitution;
mod unit_file;

pub use substitution::*;
pub use unit_file::*;
