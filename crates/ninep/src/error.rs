//! Error taxonomy for the 9P session engine.
//!
//! Errors are rendered to a short diagnostic string only at the wire boundary
//! (`Rerror.ename`); everywhere else they stay typed so the dispatcher can
//! decide whether a failure ends the session (`Protocol`) or is just another
//! `Rerror` reply.

use std::fmt;
use std::io;

#[derive(Debug)]
pub enum Error {
    /// Invalid/traversing/too-long path, unknown FID, FID already in use.
    Path(String),
    /// FID not open, not opened for writing, or already open.
    FidState(String),
    /// Any host syscall failure; carries the OS error so `ename()` can use
    /// its `Display` impl (the `strerror`-equivalent string).
    Os(io::Error),
    /// Out of memory / reply buffer would overflow.
    Resource(String),
    /// Malformed frame, unknown message type, unsupported version. Ends the
    /// session instead of producing an `Rerror`.
    Protocol(String),
}

impl Error {
    pub fn path<S: Into<String>>(msg: S) -> Error {
        Error::Path(msg.into())
    }

    pub fn fid_state<S: Into<String>>(msg: S) -> Error {
        Error::FidState(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Error {
        Error::Protocol(msg.into())
    }

    /// Whether this error should terminate the session rather than produce
    /// an `Rerror` reply.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }

    /// Short diagnostic string carried in `Rerror.ename`.
    pub fn ename(&self) -> String {
        match self {
            Error::Path(s) | Error::FidState(s) | Error::Resource(s) | Error::Protocol(s) => {
                s.clone()
            }
            Error::Os(e) => e.to_string(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ename())
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Os(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Error {
        Error::Os(io::Error::from_raw_os_error(e as i32))
    }
}
