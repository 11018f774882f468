pub mod key_format;
pub mod key_pool;
pub mod redaction;

pub use key_format::{infer_provider, split_key_list};
pub use key_pool::{
    Credential, CredentialId, CredentialStatus, KeyPool, MemoryKeyPool, PooledKey,
    QuarantineReason,
};
pub use redaction::{RedactingWriter, redact_secrets};
