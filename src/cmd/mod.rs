//! Command line arguments of the binaries.

pub mod driver;
