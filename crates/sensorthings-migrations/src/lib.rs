//! Database migrations for the SensorThings schema.
//!
//! Tables are created in the connection's current `search_path`, so a store
//! configured with a schema runs the migrator on a connection whose search
//! path starts with that schema.

pub use sea_orm_migration::prelude::*;

mod migration;
pub use migration::Migrator;
