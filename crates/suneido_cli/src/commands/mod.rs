//! CLI command implementations.

pub mod check;
pub mod compact;
pub mod dump;
pub mod inspect;
pub mod load;
pub mod rebuild;
