//! Error types for Rolodex operations

use crate::EntityId;
use thiserror::Error;

/// Failure reported by the remote record boundary itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct RemoteFailure {
    pub code: String,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not-found", message)
    }
}

/// Configuration errors. Fatal at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unknown field(s) {fields:?} declared for {entity_type} ({property})")]
    UnknownFields {
        entity_type: String,
        property: String,
        fields: Vec<String>,
    },

    #[error("Table {table}, column {column} has data type {data_type}, which is not recognised")]
    UnknownColumnType {
        table: String,
        column: String,
        data_type: String,
    },

    #[error("Entity type {entity_type} registered more than once")]
    DuplicateEntityType { entity_type: String },

    #[error("Relationship {name} declared more than once on {entity_type}")]
    DuplicateRelationship { entity_type: String, name: String },

    #[error("Unknown entity type: {entity_type}")]
    UnknownEntityType { entity_type: String },

    #[error("{entity_type} has no relationship called {name}")]
    UnknownRelationship { entity_type: String, name: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read schema file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse schema TOML: {reason}")]
    Parse { reason: String },
}

/// Validation errors. Raised before any remote call is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Parameters {params} should not contain an ID")]
    IdSupplied { params: String },

    #[error("Required field(s) {fields:?} are missing for {entity_type}")]
    RequiredFieldsMissing {
        entity_type: String,
        fields: Vec<String>,
    },

    #[error("Read-only field(s) {fields:?} supplied to {action} {entity_type}")]
    ReadOnlyFields {
        entity_type: String,
        action: String,
        fields: Vec<String>,
    },

    #[error("Invalid value {value} for {expected} field {field}")]
    TypeMismatch {
        field: String,
        expected: String,
        value: String,
    },

    #[error("{value} passed instead of parameter map")]
    NotAParameterMap { value: String },

    #[error("Fields do not include a valid integer ID: {fields}")]
    MissingId { fields: String },

    #[error("{entity} does not have a field called {field}")]
    UnknownField { entity: String, field: String },

    #[error("Cannot use {value} to look up a {entity_type}")]
    UnusableLookup { entity_type: String, value: String },

    #[error("Cannot use a null/empty value to look up a child {entity_type}")]
    EmptyChildLookup { entity_type: String },

    #[error("Child {entity_type} cache is not indexed by \"{field}\"")]
    NotIndexed { entity_type: String, field: String },

    #[error("There is no default lookup that can be used with the value {value}")]
    NoDefaultLookup { value: String },

    #[error("{entity} does not have a {parent_type}")]
    NoParent { entity: String, parent_type: String },

    #[error("{count} matching custom fields named \"{name}\" for {entity}")]
    CustomFieldMatch {
        name: String,
        count: usize,
        entity: String,
    },

    #[error("Custom field {field}: {reason}")]
    CustomFieldUsage { field: String, reason: String },

    #[error("{entity_type} does not support {operation}")]
    Unsupported {
        entity_type: String,
        operation: String,
    },
}

/// A single-result lookup found nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Expected to get a single {entity_type} but got none with parameter(s) {params}")]
pub struct NotFoundError {
    pub entity_type: String,
    pub params: String,
}

/// A single-result lookup found more than one entity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Expected to get a single {entity_type} but got {count} with parameter(s) {params}")]
pub struct CardinalityError {
    pub entity_type: String,
    pub count: usize,
    pub params: String,
}

/// Remote boundary errors, wrapped with the call that produced them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Error in remote call to {action} {entity_type} {params}: {source}")]
    CallFailed {
        entity_type: String,
        action: String,
        params: String,
        #[source]
        source: RemoteFailure,
    },

    #[error("Remote call to {action} {entity_type} {params} returned {count} values instead of the expected one")]
    UnexpectedResultCount {
        entity_type: String,
        action: String,
        params: String,
        count: usize,
    },

    #[error("Error in {entity_type} remote call: field(s) {fields:?} not present in results")]
    MissingResultFields {
        entity_type: String,
        fields: Vec<String>,
    },

    #[error("Error in {entity_type} remote call: values of field(s) returned {returned} did not match values of parameter(s) supplied {supplied}")]
    ResultMismatch {
        entity_type: String,
        supplied: String,
        returned: String,
    },
}

/// Index and lookup invariant violations. Always fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("{parent_type} {parent_id} has more than one {child_type} with a {field} of {value}")]
    DuplicateChildKey {
        parent_type: String,
        parent_id: EntityId,
        child_type: String,
        field: String,
        value: String,
    },

    #[error("{parent_type} {parent_id} does not have a {child_type} with a {field} of {value}")]
    ChildKeyMissing {
        parent_type: String,
        parent_id: EntityId,
        child_type: String,
        field: String,
        value: String,
    },

    #[error("{parent_type} {parent_id} is not in relationship cache")]
    ParentNotCached {
        parent_type: String,
        parent_id: EntityId,
    },

    #[error("{parent_type} {parent_id} is already in relationship cache")]
    ParentAlreadyCached {
        parent_type: String,
        parent_id: EntityId,
    },

    #[error("{entity} is not {expected}")]
    WrongEntityType { entity: String, expected: String },

    #[error("{entity_type} {id} is not cached")]
    NotCached { entity_type: String, id: EntityId },

    #[error("Cannot uncache {entity} as its parent {parent_type} is cached")]
    ParentCached { entity: String, parent_type: String },

    #[error("Field set's ID {snapshot_id} does not match entity's ID {entity_id}")]
    IdMismatch {
        snapshot_id: EntityId,
        entity_id: EntityId,
    },

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Master error type for all Rolodex errors.
#[derive(Debug, Clone, Error)]
pub enum RolodexError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Cardinality error: {0}")]
    Cardinality(#[from] CardinalityError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("{entity_type} {id} has been deleted")]
    Deleted { entity_type: String, id: EntityId },
}

impl RolodexError {
    /// True when the error is a downgradable "nothing found" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RolodexError::NotFound(_))
    }
}

/// Result type alias for Rolodex operations.
pub type RolodexResult<T> = Result<T, RolodexError>;

// =============================================================================
// TESTS
// =============================================================================
