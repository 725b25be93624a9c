use std::time::Duration;

use google_api_proto::google::rpc::{RetryInfo, Status as RpcStatus};
use prost::Message;
use tonic::{Code, Status};

use crate::Error;

pub(crate) const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

/// `INTERNAL` errors whose message contains one of these are broken streams or connections
/// rather than genuine server failures.
pub const DEFAULT_TRANSIENT_INTERNAL_MESSAGES: [&str; 4] = [
    "stream terminated by RST_STREAM",
    "HTTP/2 error code: INTERNAL_ERROR",
    "Connection closed with unknown cause",
    "Received unexpected EOS on DATA frame from server",
];

/// How a failure should be handled by the retry machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry the single RPC or stream.
    TransportTransient,
    /// Retry the whole transaction attempt.
    TransactionAbort,
    /// Never retried.
    Fatal,
    DeadlineExceeded,
    Canceled,
}

#[derive(Clone, Copy, Debug)]
pub struct Classification<'e> {
    pub code: Code,
    pub kind: ErrorKind,
    /// The status found in the error's cause chain, if any.
    pub cause: Option<&'e Status>,
}

impl<'e> Classification<'e> {
    pub fn is_abort(&self) -> bool {
        self.kind == ErrorKind::TransactionAbort
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::TransportTransient
    }

    fn fatal(code: Code) -> Self {
        Self {
            code,
            kind: ErrorKind::Fatal,
            cause: None,
        }
    }
}

/// Maps arbitrary, possibly wrapped, errors to an [`ErrorKind`].
///
/// The set of `INTERNAL` messages considered transient is data: these are signatures of proxies
/// and HTTP/2 stacks, not a documented contract, so they can be replaced through
/// [`ConfigBuilder::transient_internal_messages`](crate::ConfigBuilder::transient_internal_messages).
#[derive(Clone, Debug)]
pub struct ErrorClassifier {
    transient_internal: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_TRANSIENT_INTERNAL_MESSAGES
                .iter()
                .map(|msg| msg.to_string())
                .collect(),
        )
    }
}

impl ErrorClassifier {
    pub fn new(transient_internal: Vec<String>) -> Self {
        Self { transient_internal }
    }

    /// Walks the `source()` chain of `err` until a [`Error`] or a [`tonic::Status`] is found.
    ///
    /// Errors without any status in their chain are fatal.
    pub fn classify<'e>(&self, err: &'e (dyn std::error::Error + 'static)) -> Classification<'e> {
        let mut current = Some(err);
        while let Some(err) = current {
            if let Some(status) = err.downcast_ref::<Status>() {
                return self.classify_status(status);
            }
            if let Some(err) = err.downcast_ref::<Error>() {
                match err {
                    Error::Status(status) => return self.classify_status(status),
                    Error::DeadlineExceeded => {
                        return Classification {
                            code: Code::DeadlineExceeded,
                            kind: ErrorKind::DeadlineExceeded,
                            cause: None,
                        }
                    }
                    Error::Canceled => {
                        return Classification {
                            code: Code::Cancelled,
                            kind: ErrorKind::Canceled,
                            cause: None,
                        }
                    }
                    Error::TransportError(_) => {}
                    other => return Classification::fatal(other.code()),
                }
            }
            current = err.source();
        }
        Classification::fatal(Code::Unknown)
    }

    fn classify_status<'e>(&self, status: &'e Status) -> Classification<'e> {
        let kind = match status.code() {
            Code::Aborted => ErrorKind::TransactionAbort,
            Code::Unavailable => ErrorKind::TransportTransient,
            Code::Internal if self.is_transient_internal(status.message()) => {
                ErrorKind::TransportTransient
            }
            Code::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Code::Cancelled => ErrorKind::Canceled,
            _ => ErrorKind::Fatal,
        };
        Classification {
            code: status.code(),
            kind,
            cause: Some(status),
        }
    }

    fn is_transient_internal(&self, message: &str) -> bool {
        self.transient_internal
            .iter()
            .any(|signature| message.contains(signature.as_str()))
    }
}

/// The delay suggested by the server through a `google.rpc.RetryInfo` detail, if any.
pub(crate) fn retry_delay(status: &Status) -> Option<Duration> {
    let details = RpcStatus::decode(status.details()).ok()?;
    details
        .details
        .iter()
        .filter(|any| any.type_url == RETRY_INFO_TYPE)
        .find_map(|any| RetryInfo::decode(&any.value[..]).ok())
        .and_then(|info| info.retry_delay)
        .and_then(|delay| {
            if delay.seconds < 0 || delay.nanos < 0 {
                None
            } else {
                Some(Duration::new(delay.seconds as u64, delay.nanos as u32))
            }
        })
}
