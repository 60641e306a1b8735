#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::print_stdout,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]

pub mod asset;
pub mod completion;
pub mod coordinator;
pub mod engine;
mod error;
pub mod escrow;
pub mod ethereum;
pub mod htlc;
pub mod indexer;
pub mod ledger;
pub mod resolver;
mod secret;
pub mod swap;
mod timestamp;
pub mod witness;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub mod test_harness;

/// A module for exporting dependencies that appear in the public API of our
/// crate.
///
/// Consumers such as the resolver daemon need `bitcoin` types (keys,
/// addresses, transactions) to talk to this crate. Re-exporting the
/// dependency saves them from keeping a second version in sync.
pub mod export {
    pub use ::bitcoin;
}

pub use self::{
    error::Error,
    secret::{Secret, SecretCommitment, SecretHash, SecretVault},
    swap::SwapId,
    timestamp::{Clock, SystemClock, Timestamp},
};

use conquer_once::Lazy;

pub static SECP: Lazy<::bitcoin::secp256k1::Secp256k1<::bitcoin::secp256k1::All>> =
    Lazy::new(::bitcoin::secp256k1::Secp256k1::new);

/// The two parties of an Ether to Bitcoin swap.
///
/// Alice initiates: she generates the secret, locks ether in the escrow and
/// claims the bitcoin. Bob is the resolver (market maker): he funds the
/// Bitcoin HTLC and later withdraws the ether with the revealed secret.
#[derive(
    Clone,
    Copy,
    Debug,
    strum_macros::Display,
    strum_macros::EnumString,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum Role {
    Alice,
    Bob,
}
