// The error taxonomy shared by every layer of the bridge.
//
// Every fallible operation in the crate returns one of these kinds plus
// enough context to produce a single useful log line. Nothing in the
// core swallows an error: backends surface them to the facade, the
// facade surfaces them to the hosted runtime.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

// The result of any operation.
pub type Result<T> = core::result::Result<T, Error>;


#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    // Name, index, or root lookup came up empty.
    NotFound(String),
    // Operation not defined for this kind of object.
    WrongKind {
        op: &'static str,
        kind: &'static str,
    },
    // Write attempted on a constant, or during a phase that forbids it.
    NotWritable(String),
    // Called before elaboration finished, or after shutdown.
    NotReady(&'static str),
    // Stale id, wrong handle class, or a torn-down backend.
    InvalidHandle(u64),
    // Index outside the declared range.
    InvalidIndex(i64),
    // Dynamic load or symbol resolution failed.
    Load(String),
    // The underlying procedural interface said no.
    Refused {
        code: i64,
        message: String,
    },
    // An invariant check failed. Logged at critical severity; the
    // embedding layer follows up with an orderly shutdown request.
    Internal(String),
}


// Stable small-integer codes for crossing the C ABI. Zero is reserved
// for success so that callers can test the common case cheaply.
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    NotFound = 1,
    WrongKind = 2,
    NotWritable = 3,
    NotReady = 4,
    InvalidHandle = 5,
    InvalidIndex = 6,
    Load = 7,
    Refused = 8,
    Internal = 9,
}


impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::WrongKind { .. } => ErrorCode::WrongKind,
            Error::NotWritable(_) => ErrorCode::NotWritable,
            Error::NotReady(_) => ErrorCode::NotReady,
            Error::InvalidHandle(_) => ErrorCode::InvalidHandle,
            Error::InvalidIndex(_) => ErrorCode::InvalidIndex,
            Error::Load(_) => ErrorCode::Load,
            Error::Refused { .. } => ErrorCode::Refused,
            Error::Internal(_) => ErrorCode::Internal,
        }
    }

    // The log severity proportional to the error. NotFound is routine
    // during optional discovery, so it only rates debug.
    pub fn level(&self) -> log::Level {
        match self {
            Error::NotFound(_) => log::Level::Debug,
            _ => log::Level::Error,
        }
    }

    // Emit the single log line every error kind is owed. Internal
    // errors rate a louder record; the facade follows up by notifying
    // the runtime.
    pub fn report(&self, ctx: &str) {
        match self {
            Error::Internal(m) => {
                log::error!("critical: invariant violated in {}: {}", ctx, m)
            }
            e => log::log!(e.level(), "{}: {}", ctx, e),
        }
    }
}


impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "not found: {}", what),
            Error::WrongKind { op, kind } => {
                write!(f, "{} is not defined for a {}", op, kind)
            }
            Error::NotWritable(what) => write!(f, "{} is not writable", what),
            Error::NotReady(op) => {
                write!(f, "{} called outside the live simulation window", op)
            }
            Error::InvalidHandle(id) => write!(f, "invalid handle {:#x}", id),
            Error::InvalidIndex(i) => write!(f, "index {} out of range", i),
            Error::Load(msg) => write!(f, "load failed: {}", msg),
            Error::Refused { code, message } => {
                write!(f, "simulator refused (code {}): {}", code, message)
            }
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}


#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn codes_round_trip() {
        for code in 0..=9 {
            let ec = ErrorCode::try_from(code).unwrap();
            assert_eq!(i32::from(ec), code);
        }
        assert!(ErrorCode::try_from(10).is_err());
    }

    #[test]
    fn severity() {
        assert_eq!(
            Error::NotFound("x".into()).level(),
            log::Level::Debug
        );
        assert_eq!(
            Error::InvalidHandle(3).level(),
            log::Level::Error
        );
    }

    #[test]
    fn display_is_terse() {
        let e = Error::WrongKind { op: "get_value", kind: "scope" };
        assert_eq!(format!("{}", e), "get_value is not defined for a scope");
    }
}
