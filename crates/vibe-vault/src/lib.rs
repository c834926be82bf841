//! # vibe-vault
//!
//! Credential vault for Vibe. Server admin passwords and tenant connection
//! strings are sealed with AES-256-GCM under a single key loaded at startup
//! and are decrypted only when a connection is about to be opened.

pub mod descriptor;
pub mod error;
pub mod key;
pub mod vault;

pub use descriptor::ConnectionDescriptor;
pub use error::VaultError;
pub use key::EncryptionKey;
pub use vault::CredentialVault;
