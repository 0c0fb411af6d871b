//! Synthetic owner payloads.
//!
//! The system under test rejects duplicate telephone numbers with `409 Conflict`, so the
//! [`OwnerFactory`] composes telephones from the wall clock and the identity of the caller. Within
//! a single millisecond, two different workers always produce different numbers without any
//! coordination between them.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Digits reserved for the worker identity inside a telephone number.
const WORKER_DIGITS: u32 = 4;
/// Digits reserved for the per-worker sequence inside a telephone number.
const SEQUENCE_DIGITS: u32 = 3;

/// The shortest telephone that still carries at least one digit of wall-clock time.
pub const MIN_PHONE_LEN: usize = (WORKER_DIGITS + SEQUENCE_DIGITS + 1) as usize;
/// The longest supported telephone.
pub const MAX_PHONE_LEN: usize = 20;

/// An owner record as accepted by `POST /owners` and `PUT /owners/{id}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub first_name: String,
    pub last_name: String,
    pub address: String,
    pub city: String,
    pub telephone: String,
}

/// Fields to pin when generating an [`Owner`].
///
/// Every field left as `None` is freshly generated.
#[derive(Clone, Debug, Default)]
pub struct OwnerOverrides {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub telephone: Option<String>,
}

/// Who is asking for a payload. Feeds the non-time part of the telephone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// A virtual user at a given iteration. Virtual users are numbered from `1`.
    Worker { vu: u32, iteration: u64 },
    /// A monotonically increasing hint, used by the single-threaded setup phase.
    Sequence(u64),
    /// No identity available, falls back to random digits.
    Anonymous,
}

/// Produces valid [`Owner`] payloads with collision-resistant telephones.
///
/// Different workers never collide within the same millisecond. A single worker can reuse a
/// telephone once its sequence wraps: iterations `i` and `i + 1000` collide if they run at the
/// same wall-clock millisecond modulo `10^(phone_len - 7)`. At the default length of 10 that
/// window is one second, so long runs with many iterations per worker will see occasional
/// self-inflicted `409`s. Raise `phone_len` to widen the window; at 20 the time part holds the
/// full epoch millisecond and a worker can no longer collide with itself.
#[derive(Clone, Copy, Debug)]
pub struct OwnerFactory {
    phone_len: usize,
}

impl OwnerFactory {
    /// Creates a factory emitting telephones of exactly `phone_len` digits.
    pub fn new(phone_len: usize) -> Result<Self> {
        if !(MIN_PHONE_LEN..=MAX_PHONE_LEN).contains(&phone_len) {
            return Err(Error::InvalidConfig(format!(
                "phone_len must be between {MIN_PHONE_LEN} and {MAX_PHONE_LEN}, got {phone_len}"
            )));
        }
        Ok(Self { phone_len })
    }

    /// Generates a new owner, keeping every field given in `overrides`.
    pub fn make(&self, overrides: &OwnerOverrides, origin: Origin) -> Owner {
        let mut rng = rand::rng();

        Owner {
            first_name: overrides
                .first_name
                .clone()
                .unwrap_or_else(|| format!("T{}", alpha_token(&mut rng, 6))),
            last_name: overrides
                .last_name
                .clone()
                .unwrap_or_else(|| "Load".to_owned()),
            address: overrides
                .address
                .clone()
                .unwrap_or_else(|| format!("Rua {}", rng.random_range(1..=9999))),
            city: overrides
                .city
                .clone()
                .unwrap_or_else(|| "Curitiba".to_owned()),
            telephone: overrides
                .telephone
                .clone()
                .unwrap_or_else(|| self.telephone_at(origin, now_millis())),
        }
    }

    /// Composes the telephone for `origin` at the given wall-clock millisecond.
    ///
    /// Layout: `[time][worker:4][sequence:3]`, where the time part is `now_ms` truncated to the
    /// remaining digits. Worker ids wrap at `10_000` and sequences at `1_000`.
    pub fn telephone_at(&self, origin: Origin, now_ms: u64) -> String {
        let time_digits = self.phone_len as u32 - WORKER_DIGITS - SEQUENCE_DIGITS;
        let time = now_ms % 10u64.pow(time_digits);

        let (worker, sequence) = match origin {
            Origin::Worker { vu, iteration } => (
                u64::from(vu) % 10u64.pow(WORKER_DIGITS),
                iteration % 10u64.pow(SEQUENCE_DIGITS),
            ),
            // Worker `0` is never handed to a virtual user.
            Origin::Sequence(seq) => (0, seq % 10u64.pow(SEQUENCE_DIGITS)),
            Origin::Anonymous => {
                let mut rng = rand::rng();
                (
                    rng.random_range(0..10u64.pow(WORKER_DIGITS)),
                    rng.random_range(0..10u64.pow(SEQUENCE_DIGITS)),
                )
            }
        };

        format!(
            "{time:0tw$}{worker:0ww$}{sequence:0sw$}",
            tw = time_digits as usize,
            ww = WORKER_DIGITS as usize,
            sw = SEQUENCE_DIGITS as usize,
        )
    }
}

impl Default for OwnerFactory {
    fn default() -> Self {
        Self { phone_len: 10 }
    }
}

fn alpha_token(rng: &mut impl Rng, len: usize) -> String {
    (0..len)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
