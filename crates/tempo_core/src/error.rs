use thiserror::Error;

use crate::{Dimension, Timestamp};

#[derive(Debug, Error)]
pub enum TempoError {
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("validation error: {message}")]
    Validation { message: String },
    #[error("config error: {message}")]
    Config { message: String },
    #[error("unknown entity '{entity}'")]
    UnknownEntity { entity: String },
    #[error("unknown dimension '{dimension}' for entity '{entity}'")]
    UnknownDimension { entity: String, dimension: Dimension },
    #[error("unknown association '{association}' on entity '{entity}'")]
    UnknownAssociation { entity: String, association: String },
    #[error("{entity} is not valid at {at} along '{dimension}'")]
    OutOfRange {
        entity: String,
        dimension: Dimension,
        at: Timestamp,
    },
    #[error(
        "association '{association}' on '{entity}' depends on its owner and cannot be eager loaded"
    )]
    EagerLoadUnsupported { entity: String, association: String },
}

impl TempoError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn unknown_entity(entity: impl Into<String>) -> Self {
        Self::UnknownEntity {
            entity: entity.into(),
        }
    }

    pub fn unknown_dimension(entity: impl Into<String>, dimension: Dimension) -> Self {
        Self::UnknownDimension {
            entity: entity.into(),
            dimension,
        }
    }

    pub fn unknown_association(entity: impl Into<String>, association: impl Into<String>) -> Self {
        Self::UnknownAssociation {
            entity: entity.into(),
            association: association.into(),
        }
    }

    pub fn out_of_range(entity: impl Into<String>, dimension: Dimension, at: Timestamp) -> Self {
        Self::OutOfRange {
            entity: entity.into(),
            dimension,
            at,
        }
    }

    pub fn eager_load_unsupported(
        entity: impl Into<String>,
        association: impl Into<String>,
    ) -> Self {
        Self::EagerLoadUnsupported {
            entity: entity.into(),
            association: association.into(),
        }
    }

    /// Usage errors are caller mistakes and never worth retrying.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::UnknownEntity { .. }
                | Self::UnknownDimension { .. }
                | Self::UnknownAssociation { .. }
                | Self::OutOfRange { .. }
                | Self::EagerLoadUnsupported { .. }
        )
    }
}

pub type TempoResult<T> = Result<T, TempoError>;

impl From<sea_orm::DbErr> for TempoError {
    fn from(value: sea_orm::DbErr) -> Self {
        TempoError::storage(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::TempoError;
    use crate::{Dimension, Timestamp};

    #[test]
    fn helper_constructors_set_variants() {
        let err = TempoError::storage("disk");
        assert!(matches!(err, TempoError::Storage { .. }));
        let err = TempoError::not_found("missing");
        assert!(matches!(err, TempoError::NotFound { .. }));
        let err = TempoError::invalid("bad");
        assert!(matches!(err, TempoError::Validation { .. }));
        let err = TempoError::config("parse");
        assert!(matches!(err, TempoError::Config { .. }));
        let err = TempoError::unknown_entity("author");
        assert!(matches!(err, TempoError::UnknownEntity { .. }));
        let err = TempoError::unknown_association("author", "books");
        assert!(matches!(err, TempoError::UnknownAssociation { .. }));
        let err = TempoError::eager_load_unsupported("author", "books");
        assert!(matches!(err, TempoError::EagerLoadUnsupported { .. }));
    }

    #[test]
    fn out_of_range_names_dimension_and_instant() {
        let err = TempoError::out_of_range("author", Dimension::new("period"), Timestamp(42));
        let message = err.to_string();
        assert!(message.contains("period"));
        assert!(message.contains("42"));
        assert!(err.is_usage_error());
        assert!(!TempoError::storage("disk").is_usage_error());
    }
}
