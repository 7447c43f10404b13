use thiserror::Error;

/// Faults surfaced by the transport core.
///
/// Callers can distinguish retryable network/timeout faults from terminal
/// service rejections via [`IoTHubError::is_transient`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IoTHubError {
    /// The channel could not be established
    #[error("communication error: {0}")]
    Communication(String),
    /// Socket-level failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// TLS negotiation failure
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
    /// Malformed or unexpected wire traffic
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The broker did not acknowledge within the configured window
    #[error("{operation} timed out waiting for the server")]
    Timeout {
        /// The operation that was awaiting acknowledgement
        operation: &'static str,
    },
    /// The service answered with a non-success status code
    #[error("service rejected the request with status {status}")]
    ServiceRejected {
        /// HTTP-style status carried on the response topic
        status: i32,
    },
    /// The caller-supplied cancellation token fired
    #[error("operation canceled")]
    Canceled,
    /// The transport closed or faulted while the operation was in flight
    #[error("transport closed: {0}")]
    TransportClosed(String),
    /// The handler is not in a state that allows the operation
    #[error("invalid handler state: {0}")]
    InvalidState(&'static str),
}

impl IoTHubError {
    /// Whether retrying the operation on a fresh connection could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IoTHubError::Communication(_)
                | IoTHubError::Io(_)
                | IoTHubError::Timeout { .. }
                | IoTHubError::TransportClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_and_cancellation_are_not_transient() {
        assert!(!IoTHubError::ServiceRejected { status: 400 }.is_transient());
        assert!(!IoTHubError::Canceled.is_transient());
    }

    #[test]
    fn network_and_timeout_faults_are_transient() {
        assert!(IoTHubError::Communication("no route".into()).is_transient());
        assert!(IoTHubError::Timeout { operation: "subscribe" }.is_transient());
    }
}
