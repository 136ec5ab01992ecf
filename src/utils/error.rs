//! Crate-wide error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for replichat.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ChatError(pub(crate) String);

impl ChatError {
    pub fn msg(msg: impl ToString) -> Self {
        ChatError(msg.to_string())
    }
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for ChatError {}

// Generates `impl From<X> for ChatError`, keeping only the source error's
// string representation.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ChatError {
            fn from(e: $error) -> Self {
                ChatError(e.to_string())
            }
        }
    };
}

// Same as above for error types generic over the payload they carry back.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for ChatError {
            fn from(e: $error) -> ChatError {
                ChatError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(std::str::Utf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(tokio::sync::watch::error::RecvError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = ChatError("group not found".into());
        assert_eq!(format!("{}", e), String::from("group not found"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe gone");
        let e = ChatError::from(io_error);
        assert!(e.0.contains("pipe gone"));
    }

    #[test]
    fn from_addr_error() {
        let parsed = "not-an-addr".parse::<net::SocketAddr>();
        let e = ChatError::from(parsed.unwrap_err());
        assert!(!e.0.is_empty());
    }
}
