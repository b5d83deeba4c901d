use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Decode(String),
    EntityNotFound,
    EntityAlreadyExists,
    IllegalStateTransition(&'static str),
    NotConnected,
    SubjectAlreadyCompleted,
    Ws(String),
    Http(String),
    Poisoned(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Decode(msg) => write!(f, "decode failure: {msg}"),
            Error::EntityNotFound => write!(f, "entity not found"),
            Error::EntityAlreadyExists => write!(f, "entity already exists"),
            Error::IllegalStateTransition(msg) => write!(f, "illegal state transition: {msg}"),
            Error::NotConnected => write!(f, "not connected"),
            Error::SubjectAlreadyCompleted => write!(f, "subject already completed"),
            Error::Ws(msg) => write!(f, "websocket error: {msg}"),
            Error::Http(msg) => write!(f, "http error: {msg}"),
            Error::Poisoned(msg) => write!(f, "lock poisoned: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Decode(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
