//! Device identity and challenge-response authentication

pub mod authenticator;
pub mod challenge;
pub mod identity;

pub(crate) use challenge::constant_time_eq;

pub use authenticator::{
    Authenticator, ChallengeIssue, HandshakePolicy, Registration, Rotation, Verification,
};
pub use challenge::{Challenge, ChallengeStore, DEFAULT_CHALLENGE_TTL, TtlChallengeStore};
pub use identity::{DeviceKeypair, validate_public_key, verify_signature};
