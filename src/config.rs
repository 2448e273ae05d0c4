use crate::pair_code::{PairCodeOptions, PairingFlow};
use crate::session::{AlwaysRetry, HaltOnLogout, ReconnectPolicy};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OnLogout {
    /// Reconnect with the stored credentials, as after any other closure.
    #[default]
    Retry,
    /// Stop the session loop and clear the stored credentials.
    Halt,
}

/// Keeps a chat session alive and feeds its messages to the bot.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "wa-session-keeper", version, about)]
pub struct BotConfig {
    /// Phone number to link with a pairing code, in international format.
    #[arg(short, long = "phone", env = "PHONE_NUMBER")]
    pub phone_number: Option<String>,

    /// Custom 8-character pairing code (Crockford Base32 alphabet).
    #[arg(short = 'c', long, env = "PAIR_CODE")]
    pub pair_code: Option<String>,

    /// Directory holding the session credentials.
    #[arg(long, env = "SESSION_DIR", default_value = "session")]
    pub session_dir: PathBuf,

    /// File holding cached contacts, groups and recent messages.
    #[arg(long, env = "STORE_FILE", default_value = "baileys_store.json")]
    pub store_file: PathBuf,

    /// How often the metadata cache is written back, in milliseconds.
    #[arg(
        long,
        env = "STORE_WRITE_INTERVAL",
        default_value_t = 10_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub store_write_interval_ms: u64,

    /// Messages retained per conversation for retransmission requests.
    #[arg(long, default_value_t = 20)]
    pub max_messages_per_chat: usize,

    /// Delay before requesting a pairing code, in milliseconds.
    #[arg(long, default_value_t = 3_000)]
    pub pairing_delay_ms: u64,

    /// Only handle live messages sent from the bot's own account.
    #[arg(long)]
    pub private: bool,

    /// What to do when the account is logged out.
    #[arg(long, value_enum, default_value_t = OnLogout::Retry)]
    pub on_logout: OnLogout,

    /// Port for the health server.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Program that runs the protocol engine, spoken to over stdio.
    #[arg(long, env = "TRANSPORT_SIDECAR", default_value = "wa-transport-sidecar")]
    pub sidecar: PathBuf,

    /// Extra argument for the sidecar program (repeatable).
    #[arg(long = "sidecar-arg", allow_hyphen_values = true)]
    pub sidecar_args: Vec<String>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            phone_number: None,
            pair_code: None,
            session_dir: PathBuf::from("session"),
            store_file: PathBuf::from("baileys_store.json"),
            store_write_interval_ms: 10_000,
            max_messages_per_chat: 20,
            pairing_delay_ms: 3_000,
            private: false,
            on_logout: OnLogout::Retry,
            port: 3000,
            sidecar: PathBuf::from("wa-transport-sidecar"),
            sidecar_args: Vec::new(),
        }
    }
}

impl BotConfig {
    pub fn public_mode(&self) -> bool {
        !self.private
    }

    pub fn store_write_interval(&self) -> Duration {
        Duration::from_millis(self.store_write_interval_ms)
    }

    pub fn pairing_delay(&self) -> Duration {
        Duration::from_millis(self.pairing_delay_ms)
    }

    /// The pairing flow, if a phone number is configured.
    pub fn pairing_flow(&self) -> Option<PairingFlow> {
        let phone_number = self.phone_number.clone()?;
        Some(
            PairingFlow::new(PairCodeOptions {
                phone_number,
                custom_code: self.pair_code.clone(),
            })
            .with_settle_delay(self.pairing_delay()),
        )
    }

    pub fn reconnect_policy(&self) -> Arc<dyn ReconnectPolicy> {
        match self.on_logout {
            OnLogout::Retry => Arc::new(AlwaysRetry),
            OnLogout::Halt => Arc::new(HaltOnLogout),
        }
    }
}
