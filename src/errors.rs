use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
  Cancelled,
  InvalidArgument,
  Internal,
  Io,
  EndOfStream,
}

/// The error type for every fallible operation in this crate.
///
/// `kind` distinguishes caller mistakes (`InvalidArgument`), corrupt or
/// truncated inputs (`Io`), codec state violations (`Internal`) and running
/// off the end of a pull-based decoder (`EndOfStream`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LstError {
  pub kind: ErrorKind,
  pub message: String,
}

impl LstError {
  pub fn new<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
    LstError {
      kind,
      message: message.as_ref().to_string(),
    }
  }

  pub fn cancelled<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::Cancelled, message)
  }

  pub fn invalid_argument<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::InvalidArgument, message)
  }

  pub fn internal<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::Internal, message)
  }

  pub fn io<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::Io, message)
  }

  pub fn end_of_stream<S: AsRef<str>>(message: S) -> Self {
    Self::new(ErrorKind::EndOfStream, message)
  }
}

impl Display for LstError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    write!(f, "lstore {:?} error: {}", self.kind, &self.message)
  }
}

impl Error for LstError {}

impl From<std::io::Error> for LstError {
  fn from(e: std::io::Error) -> Self {
    LstError::io(e.to_string())
  }
}

pub type LstResult<T> = Result<T, LstError>;
