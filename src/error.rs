use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, Uuid),

    #[error("Illegal transition: {0}")]
    WrongState(String),

    #[error("Unrecognized logistics code")]
    InvalidCode,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    #[error("Insufficient funds: requested {requested:.2}, available {available:.2}")]
    InsufficientFunds { requested: f64, available: f64 },

    #[error("Listing already has a buyer")]
    DuplicatePurchase,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl MarketError {
    /// Transition guard helper: turns a failed compare-and-swap into the
    /// error the losing caller should see.
    pub fn wrong_state(entity: &str, detail: &str) -> Self {
        MarketError::WrongState(format!("{entity}: {detail}"))
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for MarketError {
    fn from(err: uuid::Error) -> Self {
        MarketError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for MarketError {
    fn from(err: std::io::Error) -> Self {
        MarketError::Io(err.to_string())
    }
}
