//! Helpers for tests in this and downstream crates.

use std::sync::Arc;

use parley_core::clock::Clock;
use parley_core::kv::KeyValueStore;

use crate::keystore::KeyStore;

/// PBKDF2 rounds cheap enough for test suites.
pub const FAST_ITERATIONS: u32 = 1_000;

/// A [`KeyStore`] using [`FAST_ITERATIONS`].
pub fn fast_keystore(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> KeyStore {
    KeyStore::new(store, clock).with_iterations(FAST_ITERATIONS)
}
