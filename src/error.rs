// Error taxonomy for the bill service
// Every fallible library function returns Result<T, AppError>

/// App-wide error type.
/// The HTTP layer maps each variant onto a status code.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Missing or mismatching `x-api-key` header
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed submission or missing webhook fields
    #[error("{0}")]
    BadRequest(String),

    /// Bill fields that parse but break an invariant (negative amount, bad date)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Invalid pay-link token or webhook signature
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AppError {
    /// Short machine-readable kind, used in logs and error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::BadRequest(_) => "bad_request",
            AppError::Validation(_) => "validation",
            AppError::Forbidden(_) => "forbidden",
            AppError::NotFound(_) => "not_found",
            AppError::Database(_) => "database",
            AppError::Csv(_) => "csv",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
        }
    }

    /// True for errors caused by the caller rather than by the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::Unauthorized
                | AppError::BadRequest(_)
                | AppError::Validation(_)
                | AppError::Forbidden(_)
                | AppError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AppError::Unauthorized.to_string(), "Unauthorized");
        assert_eq!(
            AppError::NotFound("Bill not found".into()).to_string(),
            "Bill not found"
        );
        assert_eq!(
            AppError::Validation("amount must be non-negative".into()).to_string(),
            "Validation error: amount must be non-negative"
        );
    }

    #[test]
    fn test_client_vs_server_errors() {
        assert!(AppError::Forbidden("Invalid signature".into()).is_client_error());
        assert!(AppError::BadRequest("x".into()).is_client_error());

        let io = AppError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(!io.is_client_error());
        assert_eq!(io.kind(), "io");
    }
}
