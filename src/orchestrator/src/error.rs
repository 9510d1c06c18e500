//! Status errors carried by responses and returned by construction.

use thiserror::Error as ThisError;

/// One error value is shared by every response slot it fails, so it is
/// cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Broken invariant inside the backend or its collaborators.
    #[error("{0}")]
    Internal(String),
    /// Request or configuration content that cannot be served.
    #[error("{0}")]
    InvalidArg(String),
    /// A resource that should exist is missing.
    #[error("{0}")]
    Unavailable(String),
    /// A feature this build or this model does not provide.
    #[error("{0}")]
    Unsupported(String),
    /// A named item does not exist.
    #[error("{0}")]
    NotFound(String),
}

impl Error {
    /// Status code name.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Internal(_) => "INTERNAL",
            Error::InvalidArg(_) => "INVALID_ARG",
            Error::Unavailable(_) => "UNAVAILABLE",
            Error::Unsupported(_) => "UNSUPPORTED",
            Error::NotFound(_) => "NOT_FOUND",
        }
    }

    /// Message without the code.
    pub fn message(&self) -> &str {
        match self {
            Error::Internal(message)
            | Error::InvalidArg(message)
            | Error::Unavailable(message)
            | Error::Unsupported(message)
            | Error::NotFound(message) => message,
        }
    }
}

impl From<memory_manager::Error> for Error {
    fn from(err: memory_manager::Error) -> Self {
        match err {
            memory_manager::Error::Unsupported(_) => Error::Unsupported(err.to_string()),
            _ => Error::Internal(err.to_string()),
        }
    }
}

impl From<module_runtime::Error> for Error {
    fn from(err: module_runtime::Error) -> Self {
        match err {
            module_runtime::Error::NotFound(_) => Error::Unavailable(err.to_string()),
            module_runtime::Error::Memory(err) => err.into(),
            _ => Error::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidArg(format!("malformed model configuration: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_conversions() {
        let err: Error = memory_manager::Error::Unsupported("no gpu".to_string()).into();
        assert_eq!(err.code(), "UNSUPPORTED");
        let err: Error = module_runtime::Error::NotFound("/m/1/model.so".to_string()).into();
        assert_eq!(err, Error::Unavailable("unable to find '/m/1/model.so'".to_string()));
        let err: Error = module_runtime::Error::Execution("boom".to_string()).into();
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(err.message(), "boom");
        let err: Error = serde_json::from_str::<u32>("{").unwrap_err().into();
        assert_eq!(err.code(), "INVALID_ARG");
    }
}
