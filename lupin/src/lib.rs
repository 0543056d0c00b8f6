pub mod anneal;
pub mod cli;
pub mod common;
pub mod error;
pub mod generative;
pub mod inference;
pub mod iwae;
pub mod pair;
pub mod rws;
pub mod trace;
