//! Shared primitives: errors, the instance registry, topology constants,
//! credentials, the run journal and the push lock.

pub mod error;
pub mod journal;
pub mod lock;
pub mod output;
pub mod registry;
pub mod secrets;
pub mod time;
pub mod topology;
pub mod upsert;
