//! Challenge/response authentication with the BLEAM.
//!
//! The BLEAM drives the exchange with a command byte on the challenge
//! characteristic:
//!
//! - `SALT` + 16 byte salt: the node signs the salt and sends the digest
//!   back, proving it holds the application key (telemetry upload).
//! - `DFU` / `REBOOT` / `UNCONFIG`: the node sends its own random salt
//!   and expects the digest back as `SIGN1` + `SIGN2` halves before it
//!   acts on the request.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::{APP_KEY_LEN, DIGEST_LEN, SALT_LEN};
use crate::error::Error;
use crate::platform::CryptoProvider;

/// HMAC-SHA256 output.
pub type Digest = [u8; DIGEST_LEN];

/// Salt sent or received in a challenge.
pub type Salt = [u8; SALT_LEN];

/// Each `SIGN1`/`SIGN2` message carries half a digest.
pub const HALF_DIGEST_LEN: usize = DIGEST_LEN / 2;

/// Software HMAC-SHA256, used by the firmware's crypto provider.
pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> Result<Digest, Error> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).map_err(|_| Error::Crypto)?;
    mac.update(msg);
    Ok(mac.finalize().into_bytes().into())
}

/// Command byte opening every challenge-characteristic notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    Salt = 0,
    Dfu = 1,
    Sign1 = 2,
    Sign2 = 3,
    Reboot = 4,
    Unconfig = 5,
}

impl TryFrom<u8> for Command {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Command::Salt),
            1 => Ok(Command::Dfu),
            2 => Ok(Command::Sign1),
            3 => Ok(Command::Sign2),
            4 => Ok(Command::Reboot),
            5 => Ok(Command::Unconfig),
            _ => Err(Error::Protocol),
        }
    }
}

/// What the current connection is authenticating for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthMode {
    None,
    /// Telemetry upload after the node signed the BLEAM's salt.
    Rssi,
    Dfu,
    Reboot,
    Unconfig,
}

impl AuthMode {
    /// Remote operation requested by `cmd`, if it is one.
    pub fn for_remote(cmd: Command) -> Option<Self> {
        match cmd {
            Command::Dfu => Some(AuthMode::Dfu),
            Command::Reboot => Some(AuthMode::Reboot),
            Command::Unconfig => Some(AuthMode::Unconfig),
            Command::Salt | Command::Sign1 | Command::Sign2 => None,
        }
    }
}

/// Signs salts with the node's application key.
pub struct CryptoSigner {
    key: [u8; APP_KEY_LEN],
}

impl CryptoSigner {
    pub const fn new(key: [u8; APP_KEY_LEN]) -> Self {
        Self { key }
    }

    pub fn sign(&self, crypto: &mut impl CryptoProvider, salt: &Salt) -> Result<Digest, Error> {
        crypto.hmac_sha256(&self.key, salt)
    }

    /// Fresh salt from the provider's RNG together with its digest.
    pub fn challenge(&self, crypto: &mut impl CryptoProvider) -> Result<(Salt, Digest), Error> {
        let mut salt = [0u8; SALT_LEN];
        crypto.random_bytes(&mut salt)?;
        let digest = self.sign(crypto, &salt)?;
        Ok((salt, digest))
    }
}

const FIRST_HALF: u8 = 0b01;
const SECOND_HALF: u8 = 0b10;

/// Result of feeding one signature half to [`AuthChallenge::accept_half`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HalfOutcome {
    /// Still waiting for the other half.
    Pending,
    /// Both halves match; perform this operation.
    Verified(AuthMode),
    /// Mismatch, malformed half, or no challenge outstanding.
    Rejected,
}

/// Per-connection authentication state.
pub struct AuthChallenge {
    mode: AuthMode,
    expected: Digest,
    received: Digest,
    halves: u8,
}

impl AuthChallenge {
    pub const fn new() -> Self {
        Self {
            mode: AuthMode::None,
            expected: [0; DIGEST_LEN],
            received: [0; DIGEST_LEN],
            halves: 0,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// The node signed the BLEAM's salt; telemetry follows.
    pub fn begin_upload(&mut self) {
        self.reset();
        self.mode = AuthMode::Rssi;
    }

    /// The node issued its own salt for a remote operation.
    pub fn begin_remote(&mut self, mode: AuthMode, expected: Digest) {
        self.reset();
        self.mode = mode;
        self.expected = expected;
    }

    /// Store one half. Comparison happens once both halves are in,
    /// whatever order they arrived in.
    pub fn accept_half(&mut self, cmd: Command, data: &[u8]) -> HalfOutcome {
        let remote = matches!(
            self.mode,
            AuthMode::Dfu | AuthMode::Reboot | AuthMode::Unconfig
        );
        let (flag, offset) = match cmd {
            Command::Sign1 => (FIRST_HALF, 0),
            Command::Sign2 => (SECOND_HALF, HALF_DIGEST_LEN),
            _ => return HalfOutcome::Rejected,
        };
        if !remote || data.len() < HALF_DIGEST_LEN {
            return HalfOutcome::Rejected;
        }

        self.received[offset..offset + HALF_DIGEST_LEN].copy_from_slice(&data[..HALF_DIGEST_LEN]);
        self.halves |= flag;
        if self.halves != FIRST_HALF | SECOND_HALF {
            return HalfOutcome::Pending;
        }

        let matches: bool = self.received.ct_eq(&self.expected).into();
        let mode = self.mode;
        self.reset();
        if matches {
            HalfOutcome::Verified(mode)
        } else {
            HalfOutcome::Rejected
        }
    }

    pub fn reset(&mut self) {
        self.mode = AuthMode::None;
        self.expected = [0; DIGEST_LEN];
        self.received = [0; DIGEST_LEN];
        self.halves = 0;
    }
}

impl Default for AuthChallenge {
    fn default() -> Self {
        Self::new()
    }
}
