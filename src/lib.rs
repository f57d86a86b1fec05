//! Off-chain state synchronizer for an attester-scoped reputation protocol.
//!
//! The [`sync::Synchronizer`] mirrors one attester's events from the ledger into a SQLite leaf
//! store and rebuilds the protocol's Merkle trees on demand. A [`user_state::UserState`] layers an
//! identity's secret over the same store to aggregate its reputation and assemble proof inputs.

pub mod config;
pub mod ledger;
pub mod merkle;
pub mod sync;
pub mod user_state;
pub mod utils;
