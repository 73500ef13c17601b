/// Padding scheme parsing and identity
pub mod factory;

pub use factory::*;
