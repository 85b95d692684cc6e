//! Command line of the `peerwired` binary.
mod args;

pub use args::Args;
