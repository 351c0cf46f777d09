//! Subsystems, one per fleet operation.

pub mod container;
pub mod events;
pub mod export;
pub mod init;
pub mod maintenance;
pub mod provision;
pub mod push;
pub mod refresh;
pub mod setup;
pub mod tags;
pub mod trust;
