//! Concrete secure store backends.
//! The preferences backend encrypts with AES-GCM under a master key sourced
//! from the OS keyring; the keychain backend hands items to the OS store.

pub mod key_provider;
pub mod keychain;
pub mod preferences;
