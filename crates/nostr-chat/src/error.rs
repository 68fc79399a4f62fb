use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Not addressed to us")]
    WrongRecipient,

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Publish failed on every relay: {0}")]
    PublishFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown room: {0}")]
    UnknownRoom(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    NostrKey(#[from] nostr::key::Error),

    #[error(transparent)]
    Nostr(#[from] nostr::event::Error),

    #[error(transparent)]
    Nip44(#[from] nostr::nips::nip44::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
