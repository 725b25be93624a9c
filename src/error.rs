use bb8::RunError;
use tonic::Code;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("spanner client error: {0}")]
    Client(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("unexpected gRPC status: {0}")]
    Status(#[from] tonic::Status),

    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("operation was canceled")]
    Canceled,
}

impl Error {
    /// The gRPC code that best describes this error.
    ///
    /// Context-derived errors report `DeadlineExceeded` and `Cancelled` even though they never
    /// reached the server.
    pub fn code(&self) -> Code {
        match self {
            Error::Status(status) => status.code(),
            Error::DeadlineExceeded => Code::DeadlineExceeded,
            Error::Canceled => Code::Cancelled,
            Error::Config(_) => Code::InvalidArgument,
            _ => Code::Unknown,
        }
    }

    // `tonic::Status` is not `Clone`; this rebuilds an equivalent error so that a failed stream
    // can keep reporting its failure. Transport errors cannot be rebuilt and become `Client`
    // errors carrying their whole cause chain.
    pub(crate) fn replay(&self) -> Error {
        match self {
            Error::Client(msg) => Error::Client(msg.clone()),
            Error::Config(msg) => Error::Config(msg.clone()),
            Error::Codec(msg) => Error::Codec(msg.clone()),
            Error::TransportError(err) => Error::Client(transport_message(err)),
            Error::Status(status) => Error::Status(tonic::Status::with_details(
                status.code(),
                status.message(),
                status.details().to_vec().into(),
            )),
            Error::DeadlineExceeded => Error::DeadlineExceeded,
            Error::Canceled => Error::Canceled,
        }
    }
}

fn transport_message(err: &tonic::transport::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

impl From<RunError<Error>> for Error {
    fn from(value: RunError<Error>) -> Self {
        match value {
            RunError::User(error) => error,
            RunError::TimedOut => Error::Client("timeout while obtaining new session".to_string()),
        }
    }
}

impl From<derive_builder::UninitializedFieldError> for Error {
    fn from(value: derive_builder::UninitializedFieldError) -> Self {
        Error::Config(format!("missing required field '{}'", value.field_name()))
    }
}
