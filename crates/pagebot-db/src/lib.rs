pub mod key_store;

pub use key_store::{ImportReport, KeyStore};
