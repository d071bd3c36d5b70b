use thiserror::Error;

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("malformed input: {message}")]
    MalformedInput { message: String },
    #[error("storage error: {message}")]
    Storage { message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
}

impl RosterError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInput {
            message: message.into(),
        }
    }

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

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Prefix the message with the operation and input that failed.
    pub fn context(self, context: impl AsRef<str>) -> Self {
        let context = context.as_ref();
        match self {
            Self::MalformedInput { message } => Self::malformed(format!("{context}: {message}")),
            Self::Storage { message } => Self::storage(format!("{context}: {message}")),
            Self::NotFound { message } => Self::not_found(format!("{context}: {message}")),
            Self::Configuration { message } => Self::config(format!("{context}: {message}")),
            Self::Conflict { message } => Self::conflict(format!("{context}: {message}")),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }
}

pub type RosterResult<T> = Result<T, RosterError>;

impl From<sea_orm::DbErr> for RosterError {
    fn from(value: sea_orm::DbErr) -> Self {
        RosterError::storage(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::RosterError;

    #[test]
    fn helper_constructors_set_variants() {
        let err = RosterError::malformed("no name");
        assert!(matches!(err, RosterError::MalformedInput { .. }));
        let err = RosterError::storage("disk");
        assert!(matches!(err, RosterError::Storage { .. }));
        let err = RosterError::not_found("missing");
        assert!(matches!(err, RosterError::NotFound { .. }));
        let err = RosterError::config("bad");
        assert!(matches!(err, RosterError::Configuration { .. }));
        let err = RosterError::conflict("dup");
        assert!(matches!(err, RosterError::Conflict { .. }));
    }

    #[test]
    fn context_keeps_variant_and_prefixes_message() {
        let err = RosterError::storage("connection reset").context("lookup by email 'a@b'");
        assert!(matches!(err, RosterError::Storage { .. }));
        assert_eq!(
            err.to_string(),
            "storage error: lookup by email 'a@b': connection reset"
        );
    }
}
