pub mod types {
    pub mod contact;
    pub mod events;
    pub mod message;
}

pub mod bot;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod jid_utils;
pub mod pair_code;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bot::{Bot, BotBuilder};
pub use config::BotConfig;
pub use error::SessionError;
