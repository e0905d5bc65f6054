use thiserror::Error;

use crate::entity_type::EntityType;

/// Request-time failures of the query pipeline.
///
/// Option and path errors are detected before any SQL is built. `Storage`,
/// `Timeout` and `Consistency` come from execution and materialization.
#[derive(Error, Debug)]
pub enum QueryError {
    /// A query option this server does not know about
    #[error("Query option not implemented: {option}={value}")]
    NotImplemented { option: String, value: String },

    /// A known query option with a malformed value
    #[error("Invalid value '{value}' for {option}: {reason}")]
    InvalidOption {
        option: String,
        value: String,
        reason: String,
    },

    /// Malformed resource path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A scoped query matched nothing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Compiler asked for a relation the registry does not declare
    #[error("Undeclared relation: {target} by {by}")]
    UndeclaredRelation {
        target: EntityType,
        by: EntityType,
    },

    /// Connection, execution or decoding failure in the store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Deadline expired before the query completed
    #[error("Query timeout after {0}ms")]
    Timeout(u64),

    /// Result rows do not line up with the compiled branch tree
    #[error("Consistency error: {0}")]
    Consistency(String),
}

impl QueryError {
    pub fn invalid_option(
        option: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        QueryError::InvalidOption {
            option: option.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn not_implemented(option: impl Into<String>, value: impl Into<String>) -> Self {
        QueryError::NotImplemented {
            option: option.into(),
            value: value.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        QueryError::NotFound(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        QueryError::Consistency(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;

/// Startup failures while building the entity registry.
#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("Entity type {0} has no definition")]
    MissingEntity(EntityType),

    #[error("Entity type {0} is defined more than once")]
    DuplicateEntity(EntityType),

    #[error("No relation declared for {target} by {by}")]
    MissingRelation {
        target: EntityType,
        by: EntityType,
    },

    #[error("Navigation {entity}/{navigation} has no reverse navigation")]
    MissingReverseNavigation {
        entity: EntityType,
        navigation: &'static str,
    },

    #[error("{entity} has more than one navigation to {target}")]
    AmbiguousAttachment {
        entity: EntityType,
        target: EntityType,
    },

    #[error("Relation {target} by {by} references undeclared column {column}")]
    UnknownColumn {
        target: EntityType,
        by: EntityType,
        column: &'static str,
    },

    #[error("Column alias {entity}.{column} collides with the identity suffix")]
    ReservedSuffix {
        entity: EntityType,
        column: &'static str,
    },

    #[error("Invalid schema name '{0}'")]
    InvalidSchema(String),
}
