use thiserror::Error;

use crate::bridge::BridgeError;

#[derive(Debug, Error)]
pub enum PicallError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("media error: {0}")]
    Media(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("a call is already in progress")]
    CallInProgress,
    #[error("no active call")]
    NoActiveCall,
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl From<std::io::Error> for PicallError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
