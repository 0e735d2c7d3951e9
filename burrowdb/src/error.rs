use thiserror::Error;

/// Error taxonomy for the whole crate.
///
/// `Clone` is load-bearing: a single failed connect attempt is fanned out to
/// every operation waiting in the ready queue, each receiving the same cause.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BurrowError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Not connected to the database")]
    NotConnected,

    #[error("Validation error: field '{field}' {message}")]
    Validation { field: String, message: String },

    #[error("Unsupported schema entry '{0}': embedded model constructors are unimplemented")]
    UnsupportedSchema(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Unknown field path '{0}'")]
    UnknownField(String),
}

impl BurrowError {
    /// Build a validation error for a named field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        BurrowError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BurrowError>;
