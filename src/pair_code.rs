//! Pair code authentication for phone number linking.
//!
//! Instead of scanning a QR code, the operator enters an 8-character code on
//! their phone under **Linked Devices > Link with phone number instead**. The
//! code is requested from the transport once per unregistered session start,
//! after a short settle delay that lets the transport finish its handshake.
//!
//! A custom code may be supplied using the Crockford Base32 alphabet
//! (`123456789ABCDEFGHJKLMNPQRSTVWXYZ`, which excludes 0, I, O and U).

use crate::jid_utils::digits_only;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use log::info;
use thiserror::Error;
use tokio::time::{Duration, sleep};

pub const CROCKFORD_ALPHABET: &[u8; 32] = b"123456789ABCDEFGHJKLMNPQRSTVWXYZ";
pub const PAIR_CODE_LEN: usize = 8;
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(3000);

const MIN_PHONE_DIGITS: usize = 7;
// E.164 numbers carry at most 15 digits.
const MAX_PHONE_DIGITS: usize = 15;
const GROUP_SIZE: usize = 4;
const GROUP_SEPARATOR: char = '-';

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairCodeError {
    #[error("Phone number is required")]
    PhoneNumberRequired,

    #[error("Phone number is too short (must be at least 7 digits)")]
    PhoneNumberTooShort,

    #[error("Phone number is too long (must be at most 15 digits)")]
    PhoneNumberTooLong,

    #[error("Phone number must not start with 0 (use international format)")]
    PhoneNumberNotInternational,

    #[error("Invalid custom code: must be 8 characters from Crockford Base32 alphabet")]
    InvalidCustomCode,

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairCodeOptions {
    /// Phone number in international format. Formatting characters such as
    /// `+`, spaces and dashes are ignored.
    pub phone_number: String,
    pub custom_code: Option<String>,
}

/// A pairing attempt for the current unregistered session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPairing {
    pub phone_number: String,
    pub requested_at: DateTime<Utc>,
    pub code: Option<String>,
}

/// Strips formatting and checks the number is a plausible international one.
pub fn normalize_phone_number(input: &str) -> Result<String, PairCodeError> {
    let digits = digits_only(input);
    if digits.is_empty() {
        return Err(PairCodeError::PhoneNumberRequired);
    }
    if digits.len() < MIN_PHONE_DIGITS {
        return Err(PairCodeError::PhoneNumberTooShort);
    }
    if digits.len() > MAX_PHONE_DIGITS {
        return Err(PairCodeError::PhoneNumberTooLong);
    }
    if digits.starts_with('0') {
        return Err(PairCodeError::PhoneNumberNotInternational);
    }
    Ok(digits)
}

pub fn is_valid_phone_number(input: &str) -> bool {
    normalize_phone_number(input).is_ok()
}

/// Validates a custom pair code and returns it uppercased.
pub fn validate_custom_code(code: &str) -> Result<String, PairCodeError> {
    let valid = code.len() == PAIR_CODE_LEN
        && code
            .bytes()
            .all(|b| CROCKFORD_ALPHABET.contains(&b.to_ascii_uppercase()));
    if valid {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(PairCodeError::InvalidCustomCode)
    }
}

/// Splits a code into dash-separated groups of four: `ABCD1234` -> `ABCD-1234`.
/// Existing separators are ignored, so formatting twice is harmless.
pub fn format_code(raw: &str) -> String {
    let chars: Vec<char> = raw
        .chars()
        .filter(|c| *c != GROUP_SEPARATOR && !c.is_whitespace())
        .collect();
    chars
        .chunks(GROUP_SIZE)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(&GROUP_SEPARATOR.to_string())
}

/// Validates the configured number and requests a pairing code.
#[derive(Debug, Clone)]
pub struct PairingFlow {
    options: PairCodeOptions,
    settle_delay: Duration,
}

impl PairingFlow {
    pub fn new(options: PairCodeOptions) -> Self {
        Self {
            options,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn options(&self) -> &PairCodeOptions {
        &self.options
    }

    /// Returns the normalized phone number and custom code.
    pub fn validate(&self) -> Result<(String, Option<String>), PairCodeError> {
        let phone_number = normalize_phone_number(&self.options.phone_number)?;
        let custom_code = self
            .options
            .custom_code
            .as_deref()
            .map(validate_custom_code)
            .transpose()?;
        Ok((phone_number, custom_code))
    }

    /// Waits for the settle delay, then asks the transport for a code.
    /// Failures are returned to the caller and never retried here.
    pub async fn request_code(&self, transport: &dyn Transport) -> Result<PendingPairing, PairCodeError> {
        let (phone_number, custom_code) = self.validate()?;
        let requested_at = Utc::now();

        sleep(self.settle_delay).await;
        info!(
            target: "Session/PairCode",
            "Requesting pairing code for phone: {}",
            phone_number
        );

        let raw = transport
            .request_pairing_code(&phone_number, custom_code.as_deref())
            .await
            .map_err(|e| PairCodeError::RequestFailed(e.to_string()))?;

        Ok(PendingPairing {
            phone_number,
            requested_at,
            code: Some(format_code(&raw)),
        })
    }
}
