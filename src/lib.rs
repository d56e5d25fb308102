#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod backend;
pub mod cli;
pub mod config;
pub mod configuration;
pub mod disk;
pub mod error;
pub mod flow;
pub mod host;
pub mod hypervisor;
pub mod identity;
pub mod image;
pub mod instance;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod options;
pub mod paths;
pub mod progress;
pub mod registry;
pub mod util;
pub mod workers;
