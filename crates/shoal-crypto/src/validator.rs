//! Per-channel incoming nonce validation.
//!
//! A channel is an ordered (source, destination) pair. The first accepted
//! nonce pins the sender's cookie and must carry a zero overflow counter;
//! every later nonce must keep the same cookie and a strictly greater
//! combined sequence number. Violations are fatal to the connection — replay
//! and downgrade protection is not recoverable locally.

use thiserror::Error;

use shoal_core::nonce::Cookie;

/// A rejected nonce, with the reason.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NonceViolation {
    #[error("cookie changed mid-channel")]
    CookieMismatch,

    #[error("client cookie equals the server cookie")]
    CookieConflict,

    #[error("first nonce on channel has non-zero overflow")]
    InvalidInitial,

    #[error("combined sequence number not increasing (last {last}, got {got})")]
    NotIncreasing { last: u64, got: u64 },
}

/// Validator state for one incoming channel.
#[derive(Debug)]
pub struct NonceValidator {
    /// Cookie the sender may not use (the server's own, on the
    /// client-to-server channel).
    forbidden: Option<Cookie>,
    /// Pinned sender cookie, set by the first accepted nonce.
    cookie: Option<Cookie>,
    /// Last accepted combined sequence number.
    last: Option<u64>,
}

impl NonceValidator {
    /// Create a validator. `forbidden` rejects a specific cookie on first
    /// use (a client must not echo the server's own cookie).
    pub fn new(forbidden: Option<Cookie>) -> Self {
        Self {
            forbidden,
            cookie: None,
            last: None,
        }
    }

    /// The pinned sender cookie, if any nonce has been accepted yet.
    pub fn cookie(&self) -> Option<&Cookie> {
        self.cookie.as_ref()
    }

    /// Validate a nonce and record it on success.
    pub fn check_and_record(&mut self, cookie: &Cookie, csn: u64) -> Result<(), NonceViolation> {
        match self.cookie {
            None => {
                if self.forbidden.as_ref() == Some(cookie) {
                    return Err(NonceViolation::CookieConflict);
                }
                if csn >> 32 != 0 {
                    return Err(NonceViolation::InvalidInitial);
                }
                self.cookie = Some(*cookie);
                self.last = Some(csn);
                Ok(())
            }
            Some(pinned) => {
                if pinned != *cookie {
                    return Err(NonceViolation::CookieMismatch);
                }
                // `last` is always set alongside `cookie`
                let last = self.last.unwrap_or(0);
                if csn <= last {
                    return Err(NonceViolation::NotIncreasing { last, got: csn });
                }
                self.last = Some(csn);
                Ok(())
            }
        }
    }
}
