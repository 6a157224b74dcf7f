/// Type alias for the crate-wide result type. Failures raised by this crate
/// carry an [`RpcError`] payload, [`to_rpc_error`] gets it back out.
pub type Result<T> = anyhow::Result<T>;

/// Failure category of an [`RpcError`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RpcErrorKind {
    /// Queue creation or deletion was rejected by the transport.
    Provisioning,
    /// A send was rejected, or retries against the transport ran out.
    Publish,
    /// Transient connectivity or throttling failure at the transport.
    Transport,
    /// The application handler failed while processing a request.
    Handler,
    /// The reply queue lost its heartbeat or was removed and can no longer
    /// deliver responses.
    QueueUnhealthy,
    /// A queue or message named by the operation does not exist.
    NotFound,
    /// A bug or a broken caller contract inside this process.
    Internal,
}

impl RpcErrorKind {
    pub fn into_error(self, queue: Option<&str>, message: &str) -> RpcError {
        RpcError {
            kind: self,
            queue: queue.map(ToString::to_string),
            message: message.to_string(),
        }
    }

    /// Helper to create error results.
    pub fn into_result<T>(self, queue: Option<&str>, message: &str) -> Result<T> {
        Err(anyhow::Error::new(self.into_error(queue, message)))
    }
}

/// Error raised by queue operations, returned as `anyhow::Error`. The
/// `queue` field names the queue the operation worked on, when there is one.
#[derive(Clone, Debug)]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub queue: Option<String>,
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.queue {
            Some(queue) => write!(f, "{:?} on queue {}: {}", self.kind, queue, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for RpcError {}

/// Converts an `anyhow::Error` back to `RpcError`. Errors raised outside
/// this crate are reported as `Internal`.
pub fn to_rpc_error(err: anyhow::Error) -> RpcError {
    match err.downcast::<RpcError>() {
        Ok(rpc_error) => rpc_error,
        Err(other) => RpcErrorKind::Internal.into_error(None, &format!("{other:#}")),
    }
}

/// Shorthand for an `Err` result carrying an [`RpcError`].
#[macro_export]
macro_rules! rpc_error {
    ($kind:expr, $message:expr) => {
        ::std::result::Result::Err(::anyhow::Error::new($crate::error::RpcError {
            kind: $kind,
            queue: None,
            message: ::std::string::String::from($message),
        }))
    };
    ($kind:expr, $queue:expr, $message:expr) => {
        ::std::result::Result::Err(::anyhow::Error::new($crate::error::RpcError {
            kind: $kind,
            queue: ::std::option::Option::Some(::std::string::String::from($queue)),
            message: ::std::string::String::from($message),
        }))
    };
}

/// Logs and swallows the error value of a result.
#[macro_export]
macro_rules! logerr {
    ($val:expr) => {
        if let ::std::result::Result::Err(e) = $val {
            ::log::error!("Error {:?}", e)
        }
    };
}
