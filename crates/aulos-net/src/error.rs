use thiserror::Error;

/// Which retry counter a retryable failure consumes.
///
/// The retry engine keeps one counter per class: a flaky server should
/// not eat into the budget reserved for an offline machine coming back,
/// and vice versa.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Regular,
    Offline,
}

/// Centralized error type for aulos-net.
#[derive(Debug, Error, Clone)]
pub enum NetError {
    #[error("Timeout")]
    Timeout,

    #[error("HTTP {status} for URL: {url}")]
    HttpStatus { status: u16, url: String },

    /// Transport-level failure (connection reset, TLS, ...) while the
    /// network itself looked reachable.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The local machine appears to have no connectivity (DNS failure,
    /// connection refused on every route).
    #[error("Offline: {0}")]
    Offline(String),

    #[error("Response could not be parsed: {0}")]
    Parse(String),

    /// Error surfaced by an application-provided loader. Retryability is
    /// decided by the attached flag, or inferred from the status code.
    #[error("Custom loader error: {message}")]
    CustomLoader {
        message: String,
        can_retry: Option<bool>,
        status: Option<u16>,
    },

    #[error("Request failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        source: Box<NetError>,
    },

    #[error("No remaining candidate URL")]
    NoCandidateLeft,

    #[error("Cancelled")]
    Cancelled,
}

impl NetError {
    pub fn http_status(status: u16, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Retry class of this error, `None` when it must not be retried.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            NetError::Timeout | NetError::Transport(_) | NetError::Parse(_) => {
                Some(ErrorClass::Regular)
            }
            NetError::Offline(_) => Some(ErrorClass::Offline),
            NetError::HttpStatus { status, .. } => {
                if *status >= 500 || matches!(status, 408 | 429) {
                    Some(ErrorClass::Regular)
                } else {
                    None
                }
            }
            NetError::CustomLoader {
                can_retry, status, ..
            } => match can_retry {
                Some(true) => Some(ErrorClass::Regular),
                Some(false) => None,
                None => status.and_then(|s| {
                    NetError::HttpStatus {
                        status: s,
                        url: String::new(),
                    }
                    .error_class()
                }),
            },
            NetError::RetryExhausted { .. }
            | NetError::NoCandidateLeft
            | NetError::Cancelled => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.error_class().is_some()
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, NetError::Cancelled)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            NetError::HttpStatus { status, .. } => Some(*status),
            NetError::CustomLoader { status, .. } => *status,
            _ => None,
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::timeout(NetError::Timeout, Some(ErrorClass::Regular))]
    #[case::transport(NetError::transport("reset"), Some(ErrorClass::Regular))]
    #[case::parse(NetError::Parse("bad box".into()), Some(ErrorClass::Regular))]
    #[case::offline(NetError::Offline("dns".into()), Some(ErrorClass::Offline))]
    #[case::http_500(NetError::http_status(500, "u"), Some(ErrorClass::Regular))]
    #[case::http_503(NetError::http_status(503, "u"), Some(ErrorClass::Regular))]
    #[case::http_429(NetError::http_status(429, "u"), Some(ErrorClass::Regular))]
    #[case::http_408(NetError::http_status(408, "u"), Some(ErrorClass::Regular))]
    #[case::http_404(NetError::http_status(404, "u"), None)]
    #[case::http_403(NetError::http_status(403, "u"), None)]
    #[case::cancelled(NetError::Cancelled, None)]
    fn classification(#[case] error: NetError, #[case] expected: Option<ErrorClass>) {
        assert_eq!(error.error_class(), expected);
    }

    #[rstest]
    #[case::explicit_yes(Some(true), None, Some(ErrorClass::Regular))]
    #[case::explicit_no(Some(false), Some(503), None)]
    #[case::inferred_retryable(None, Some(502), Some(ErrorClass::Regular))]
    #[case::inferred_banned(None, Some(404), None)]
    #[case::no_information(None, None, None)]
    fn custom_loader_classification(
        #[case] can_retry: Option<bool>,
        #[case] status: Option<u16>,
        #[case] expected: Option<ErrorClass>,
    ) {
        let error = NetError::CustomLoader {
            message: "loader".into(),
            can_retry,
            status,
        };
        assert_eq!(error.error_class(), expected);
    }
}
