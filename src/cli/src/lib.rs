//! scantask CLI - consume scan jobs or fetch a single artifact.

pub mod commands;
pub mod logging;
