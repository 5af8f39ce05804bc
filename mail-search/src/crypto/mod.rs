//! Index encryption
//!
//! Every searchable record is sealed with AES-256-GCM under a per-user key
//! before it reaches the index store. Keys live in host-provided secure
//! storage and are generated lazily the first time a user's index is opened.

pub mod cipher;
pub mod keys;

pub use cipher::{Cipher, KEY_LEN};
pub use keys::{FileKeyStorage, KeyProvider, MemoryKeyStorage, SecureKeyStorage};
