use std::fmt::Display;
use std::num::ParseIntError;
use std::str::Utf8Error;
use std::string::FromUtf8Error;
use std::{fmt, io};

#[derive(Debug)]
pub enum ProxyError {
    //////////////////////
    // Common
    //////////////////////
    /// A condition that cannot occur unless an internal invariant has been
    /// broken. Callers are allowed to abort on this variant.
    Bug(String),
    /// A recoverable error without a more specific category.
    Error(String),

    //////////////////////
    // Wire protocol
    //////////////////////
    /// A frame that violates the MySQL packet format.
    MalformedPacket(String),
    /// Proxy-protocol preamble that could not be parsed.
    ProxyHeaderErr(String),

    //////////////////////
    // IO
    //////////////////////
    IoError(io::Error),
    Utf8Error(Utf8Error),
    FromUtf8Error(FromUtf8Error),
    ParseIntError(ParseIntError),
    ConnectionError(String),

    /// Poll registration failed in a way the caller may degrade on,
    /// typically by refusing the new connection.
    ResourceExhausted(String),

    ConfigFileParseErr(String),

    CdcAuthErr(String),
    CdcProtocolErr(String),
}

impl Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> fmt::Result {
        match self {
            ProxyError::Bug(s)
            | ProxyError::Error(s)
            | ProxyError::MalformedPacket(s)
            | ProxyError::ProxyHeaderErr(s)
            | ProxyError::ConnectionError(s)
            | ProxyError::ResourceExhausted(s)
            | ProxyError::ConfigFileParseErr(s)
            | ProxyError::CdcAuthErr(s)
            | ProxyError::CdcProtocolErr(s) => {
                write!(f, "{}", s)
            }
            ProxyError::IoError(err) => {
                write!(f, "{}", err)
            }
            ProxyError::Utf8Error(err) => {
                write!(f, "{}", err)
            }
            ProxyError::FromUtf8Error(err) => {
                write!(f, "{}", err)
            }
            ProxyError::ParseIntError(err) => {
                write!(f, "{}", err)
            }
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(error: io::Error) -> Self {
        ProxyError::IoError(error)
    }
}

impl From<Utf8Error> for ProxyError {
    fn from(error: Utf8Error) -> Self {
        ProxyError::Utf8Error(error)
    }
}

impl From<FromUtf8Error> for ProxyError {
    fn from(error: FromUtf8Error) -> Self {
        ProxyError::FromUtf8Error(error)
    }
}

impl From<ParseIntError> for ProxyError {
    fn from(error: ParseIntError) -> Self {
        ProxyError::ParseIntError(error)
    }
}

impl ProxyError {
    /// True for errors that indicate broken ownership or descriptor-table
    /// corruption. The process must not continue past these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Bug(_))
    }
}
