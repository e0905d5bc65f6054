//! # sensorthings-query
//!
//! Query core of the SensorThings server: the static entity registry, the
//! OData-style query option parser, the SQL compiler and the result
//! materializer.
//!
//! ## Flow
//!
//! - [`QueryOptions::parse`] turns raw `$option` pairs into a validated intent
//! - [`QueryCompiler::compile`] resolves it against the [`Registry`] into a
//!   [`BranchTree`] and one SQL statement with bound parameters
//! - a storage backend ([`EntityStore`]) executes the statement
//! - [`Materializer::materialize`] folds the flat rows back into nested [`Entity`] values
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sensorthings_query::{EntityType, QueryCompiler, QueryOptions, QueryTarget, Registry};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(Registry::sensorthings(None)?);
//! let compiler = QueryCompiler::new(registry, 100);
//!
//! let options = QueryOptions::parse([("$expand", "Datastreams($top=5)")])?;
//! let target = QueryTarget::by_id(EntityType::Thing, 1);
//! let compiled = compiler.compile(&target, &options)?;
//! assert!(compiled.sql.contains("LEFT JOIN LATERAL"));
//! # Ok(())
//! # }
//! ```

pub mod branch;
pub mod codes;
pub mod compiler;
pub mod entity;
pub mod entity_type;
pub mod error;
pub mod materializer;
pub mod odata;
pub mod registry;
pub mod traits;
pub mod types;
pub mod value;

pub use branch::{Branch, BranchTree, OutputColumn};
pub use compiler::{CompiledCount, CompiledQuery, Param, QueryCompiler};
pub use entity::{Entity, Related};
pub use entity_type::EntityType;
pub use error::{QueryError, RegistryError, Result};
pub use materializer::Materializer;
pub use odata::{ExpandItem, Filter, OrderByItem, QueryOptions, ResultFormat, SortOrder};
pub use registry::{Cardinality, FieldDef, FieldKind, Navigation, Registry};
pub use traits::EntityStore;
pub use types::{QueryResult, QueryStats, QueryTarget, Scope};
pub use value::{ColumnKind, ColumnValue};
