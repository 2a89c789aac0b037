//! Variable inheritance and secret handling.

pub mod resolver;
pub mod secret;

pub use resolver::{decrypt_all, decrypt_map, split_by_type, ResolvedVars, ScopeIds, VariableResolver};
pub use secret::{is_encrypted, SealedCipher, SecretCipher, ENCRYPTED_PREFIX};
