// Structured error kinds, mirroring the abstract kinds a component can report to its owner.
// Cross-component glue still uses anyhow::Result with .context(); this type is for call sites
// that need to match on *why* something failed (Dn mapping a kind to tagged BAD/NO, a healthcheck
// distinguishing Frozen from ImaildirFailed).

use std::{fmt, io};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
  Parse,
  Response,
  Value,
  Param,
  Nomem,
  Os,
  Fs,
  Frozen,
  ImaildirFailed,
  Not4Me,
  Break,
}

impl fmt::Display for Kind {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    let s = match self {
      Kind::Parse => "parse",
      Kind::Response => "response",
      Kind::Value => "value",
      Kind::Param => "param",
      Kind::Nomem => "nomem",
      Kind::Os => "os",
      Kind::Fs => "fs",
      Kind::Frozen => "frozen",
      Kind::ImaildirFailed => "imaildir failed",
      Kind::Not4Me => "not4me",
      Kind::Break => "break",
    };
    write!(formatter, "{s}")
  }
}

#[derive(Debug)]
pub struct Error {
  kind: Kind,
  source: anyhow::Error,
}

impl Error {
  pub fn new(kind: Kind, source: impl Into<anyhow::Error>) -> Self {
    Self {
      kind,
      source: source.into(),
    }
  }

  pub fn msg(kind: Kind, message: impl fmt::Display + Send + Sync + 'static) -> Self {
    Self {
      kind,
      source: anyhow::anyhow!("{message}"),
    }
  }

  pub fn kind(&self) -> Kind {
    self.kind
  }
}

impl fmt::Display for Error {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "{}: {}", self.kind, self.source)
  }
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    self.source.source()
  }
}

impl From<io::Error> for Error {
  fn from(error: io::Error) -> Self {
    let kind = match error.kind() {
      io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => Kind::Fs,
      _ => Kind::Os,
    };
    Self::new(kind, error)
  }
}

pub type Result<T> = std::result::Result<T, Error>;
