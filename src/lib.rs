pub mod config;
pub mod core;
pub mod error;
pub mod fasta;
pub mod log;
pub mod newick;
pub mod orchestration;
pub mod report;

pub use error::{Error, Result};
pub use report::{RunMode, RunReport};
