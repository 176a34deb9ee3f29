//! On-disk row formats.

pub mod csv;
