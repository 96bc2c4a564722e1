use thiserror::Error;

/// 网关统一错误类型
///
/// 每个变体都有稳定的机器可读错误码（`code()`）和对应的HTTP状态码，
/// 客户端错误（4xx）直接返回给调用方，不会触发故障转移。
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Provider '{provider}' does not support {operation}")]
    UnsupportedOperation {
        provider: String,
        operation: &'static str,
    },

    #[error("Upstream '{provider}' returned status {status}: {body}")]
    Upstream {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Upstream call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("No provider available for model '{model}': {reason}")]
    RoutingExhausted { model: String, reason: String },

    #[error("No provider matches model '{0}'")]
    NoProviderForModel(String),

    #[error("Provider '{0}' is not registered")]
    ProviderNotRegistered(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Connection pool exhausted for provider '{0}'")]
    PoolExhausted(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// 稳定的机器可读错误码
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Validation(_) => "invalid_request",
            Error::UnsupportedOperation { .. } => "unsupported_operation",
            Error::Upstream { .. } => "upstream_error",
            Error::Transport(_) => "upstream_unreachable",
            Error::Timeout(_) => "upstream_timeout",
            Error::RoutingExhausted { .. } => "routing_exhausted",
            Error::NoProviderForModel(_) => "no_provider_for_model",
            Error::ProviderNotRegistered(_) => "provider_not_registered",
            Error::CacheUnavailable(_) => "cache_unavailable",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::Unauthorized(_) => "unauthorized",
            Error::RateLimited { .. } => "rate_limited",
            Error::InsufficientBalance(_) => "insufficient_balance",
            Error::NotFound(_) => "not_found",
            Error::Ledger(_) => "ledger_unavailable",
            Error::Protocol(_) => "protocol_error",
            Error::Serialization(_) => "serialization_error",
            Error::Io(_) => "io_error",
        }
    }

    /// 错误对应的HTTP状态码
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::Serialization(_) => 400,
            Error::UnsupportedOperation { .. } => 400,
            Error::Unauthorized(_) => 401,
            Error::InsufficientBalance(_) => 402,
            Error::NotFound(_) => 404,
            Error::NoProviderForModel(_) => 404,
            Error::RateLimited { .. } => 429,
            Error::Upstream { status, .. } if (400..500).contains(status) => *status,
            Error::Upstream { .. } | Error::Transport(_) | Error::Protocol(_) => 502,
            Error::Timeout(_) => 504,
            Error::RoutingExhausted { .. }
            | Error::ProviderNotRegistered(_)
            | Error::PoolExhausted(_)
            | Error::CacheUnavailable(_)
            | Error::Ledger(_) => 503,
            Error::Config(_) | Error::Io(_) => 500,
        }
    }

    /// 是否为客户端错误（4xx），这类错误不应重试或故障转移
    pub fn is_client_error(&self) -> bool {
        match self {
            Error::Upstream { status, .. } => {
                // 429 是上游限流，换一个供应商可能成功
                (400..500).contains(status) && *status != 429
            }
            Error::Validation(_)
            | Error::UnsupportedOperation { .. }
            | Error::Unauthorized(_)
            | Error::InsufficientBalance(_)
            | Error::RateLimited { .. }
            | Error::NotFound(_) => true,
            _ => false,
        }
    }

    /// 是否为连接级别的传输错误（请求未送达上游，可以安全重试）
    pub fn is_retryable_transport(&self, idempotent: bool) -> bool {
        match self {
            Error::Transport(e) => e.is_connect() || (idempotent && e.is_timeout()),
            _ => false,
        }
    }

    /// 错误类别，用于HTTP错误体中的 `type` 字段
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Validation(_) | Error::Serialization(_) => "validation_error",
            Error::UnsupportedOperation { .. } => "unsupported_operation_error",
            Error::Upstream { .. } | Error::Transport(_) | Error::Timeout(_) | Error::Protocol(_) => {
                "upstream_error"
            }
            Error::RoutingExhausted { .. }
            | Error::NoProviderForModel(_)
            | Error::ProviderNotRegistered(_) => "routing_error",
            Error::CacheUnavailable(_) => "cache_error",
            Error::PoolExhausted(_) => "backpressure_error",
            Error::Unauthorized(_) => "authentication_error",
            Error::RateLimited { .. } => "rate_limit_error",
            Error::InsufficientBalance(_) | Error::Ledger(_) => "billing_error",
            Error::NotFound(_) => "not_found_error",
            Error::Config(_) | Error::Io(_) => "gateway_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_client_errors_are_not_retried() {
        let err = Error::Upstream {
            provider: "openai".into(),
            status: 400,
            body: "bad".into(),
        };
        assert!(err.is_client_error());
        assert_eq!(err.status_code(), 400);

        let throttled = Error::Upstream {
            provider: "openai".into(),
            status: 429,
            body: String::new(),
        };
        assert!(!throttled.is_client_error());

        let server = Error::Upstream {
            provider: "openai".into(),
            status: 503,
            body: String::new(),
        };
        assert!(!server.is_client_error());
        assert_eq!(server.status_code(), 502);
    }

    #[test]
    fn routing_errors_have_distinct_codes() {
        assert_eq!(
            Error::NoProviderForModel("x".into()).code(),
            "no_provider_for_model"
        );
        assert_eq!(
            Error::ProviderNotRegistered("x".into()).code(),
            "provider_not_registered"
        );
        assert_eq!(
            Error::RoutingExhausted {
                model: "x".into(),
                reason: "cooldown".into()
            }
            .status_code(),
            503
        );
    }
}
