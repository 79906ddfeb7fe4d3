use thiserror::Error;

/// Infrastructure-level error for store, vendor, and wiring failures.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SMS vendor error: {0}")]
    Vendor(String),

    #[error("Telegram error: {0}")]
    Telegram(#[from] TgError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Uniform outcome taxonomy for every Telegram call, regardless of which
/// vendor error produced it. Workers branch on these variants; nothing
/// outside the session layer ever sees a raw client error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TgError {
    /// The account must pause for `seconds` before further calls.
    #[error("flood wait for {seconds}s")]
    FloodWait { seconds: u32 },

    /// The recipient's privacy settings forbid messages from strangers.
    #[error("recipient privacy settings forbid the message")]
    PrivacyRestricted,

    /// The recipient has blocked the sender account.
    #[error("recipient has blocked this account")]
    UserBlocked,

    /// The account is rate-limited against contacting new peers.
    #[error("peer flood limit reached")]
    PeerFlood,

    /// Writing to the chat or channel is not allowed for this account.
    #[error("writing to this chat is forbidden")]
    WriteForbidden,

    #[error("invalid peer")]
    InvalidPeer,

    #[error("user not found")]
    UserNotFound,

    #[error("invalid login code")]
    InvalidCode,

    #[error("login code expired")]
    CodeExpired,

    /// Two-factor password is required to finish signing in.
    #[error("2FA password needed")]
    PasswordNeeded,

    #[error("invalid 2FA password")]
    InvalidPassword,

    /// The stored session is no longer authorized.
    #[error("session not authorized")]
    NotAuthorized,

    /// The reaction emoji is not allowed on this post.
    #[error("reaction not allowed")]
    InvalidReaction,

    /// The client could not be set up at all (connect/proxy failure).
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Transport-level failure during a call.
    #[error("network error: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl TgError {
    /// Errors that permanently settle the (campaign, recipient) pair:
    /// the recipient is marked done and never retried.
    pub fn is_recipient_terminal(&self) -> bool {
        matches!(
            self,
            TgError::PrivacyRestricted
                | TgError::UserBlocked
                | TgError::InvalidPeer
                | TgError::UserNotFound
                | TgError::WriteForbidden
        )
    }

    /// Errors counted against the sender account's consecutive-error
    /// streak and retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TgError::Network(_) | TgError::Unreachable(_) | TgError::Other(_)
        )
    }
}
