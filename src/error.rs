use crate::detect::Platform;

/// Component-level result type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Typed errors for the routing pipeline. Each variant maps to a
/// machine-readable code and an HTTP status class in the webhook response.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Required identity fields are missing from the request.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Tenant or credential could not be resolved when required.
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// Remote platform RPC failed or timed out. Single attempt, no retry.
    #[error("delivery via {platform} failed: {message}")]
    Delivery {
        platform: &'static str,
        message: String,
    },

    /// Durable store unavailable. Fatal for the current request.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// No sender exists for the given platform tag. Configuration error,
    /// never expected in steady state given the detector's closed enum.
    #[error("no sender for platform {0:?}")]
    UnsupportedPlatform(Platform),
}

impl BridgeError {
    pub fn validation(message: impl std::fmt::Display) -> Self {
        Self::Validation(message.to_string())
    }

    pub fn resolution(message: impl std::fmt::Display) -> Self {
        Self::Resolution(message.to_string())
    }

    pub fn delivery(platform: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Delivery {
            platform,
            message: message.to_string(),
        }
    }

    /// Machine-readable code included in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Resolution(_) => "RESOLUTION_ERROR",
            Self::Delivery { .. } => "DELIVERY_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::UnsupportedPlatform(_) => "UNSUPPORTED_PLATFORM",
        }
    }

    /// HTTP status the webhook response carries for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Resolution(_) => 400,
            Self::Delivery { .. } => 502,
            Self::Storage(_) | Self::UnsupportedPlatform(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_status_classes() {
        assert_eq!(BridgeError::validation("x").code(), "VALIDATION_ERROR");
        assert_eq!(BridgeError::validation("x").http_status(), 400);
        assert_eq!(BridgeError::delivery("telegram", "boom").code(), "DELIVERY_ERROR");
        assert_eq!(BridgeError::delivery("telegram", "boom").http_status(), 502);
        assert_eq!(
            BridgeError::UnsupportedPlatform(Platform::Unknown).http_status(),
            500
        );
    }
}
