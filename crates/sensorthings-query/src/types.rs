use crate::entity::Entity;
use crate::entity_type::EntityType;
use crate::error::{QueryError, Result};
use std::fmt;

/// Restricts a root query to rows related to one entity of another type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub entity_type: EntityType,
    pub id: i64,
}

/// What a request asks for: a root entity type, optionally by id and/or
/// scoped by a related entity.
///
/// `Datastreams(1)/Thing` is `QueryTarget::collection(Thing).scoped_by(Datastream, 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTarget {
    pub entity_type: EntityType,
    pub id: Option<i64>,
    pub scope: Option<Scope>,
}

impl QueryTarget {
    pub fn collection(entity_type: EntityType) -> Self {
        QueryTarget {
            entity_type,
            id: None,
            scope: None,
        }
    }

    pub fn by_id(entity_type: EntityType, id: i64) -> Self {
        QueryTarget {
            entity_type,
            id: Some(id),
            scope: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn scoped_by(mut self, entity_type: EntityType, id: i64) -> Self {
        self.scope = Some(Scope { entity_type, id });
        self
    }

    /// An addressed entity that matched nothing is not found.
    ///
    /// Empty scoped collections are left to [`QueryTarget::unconfirmed_scope`]:
    /// they are only not-found when the scoping entity itself is missing.
    pub fn ensure_found(&self, entities: &[Entity]) -> Result<()> {
        if self.id.is_some() && entities.is_empty() {
            return Err(QueryError::not_found(self.to_string()));
        }
        Ok(())
    }

    /// The scope whose existence decides between an empty page and not-found.
    pub fn unconfirmed_scope(&self, entities: &[Entity]) -> Option<Scope> {
        match self.scope {
            Some(scope) if self.id.is_none() && entities.is_empty() => Some(scope),
            _ => None,
        }
    }
}

impl fmt::Display for QueryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scope) = &self.scope {
            write!(f, "{}({})/", scope.entity_type.set_name(), scope.id)?;
        }
        f.write_str(self.entity_type.set_name())?;
        if let Some(id) = self.id {
            write!(f, "({})", id)?;
        }
        Ok(())
    }
}

/// Execution statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryStats {
    pub row_count: usize,
    pub execution_ms: u64,
}

/// Materialized root entities plus the total count when `$count` was requested.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub entities: Vec<Entity>,
    pub count: Option<i64>,
    pub stats: QueryStats,
}

impl QueryResult {
    pub fn new(entities: Vec<Entity>, count: Option<i64>) -> Self {
        Self {
            entities,
            count,
            stats: QueryStats::default(),
        }
    }

    pub fn with_stats(mut self, row_count: usize, execution_ms: u64) -> Self {
        self.stats = QueryStats {
            row_count,
            execution_ms,
        };
        self
    }
}
