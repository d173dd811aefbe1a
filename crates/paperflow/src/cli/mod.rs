//! CLI commands for the paperflow binary

pub mod devices;
pub mod output;
pub mod scan;
