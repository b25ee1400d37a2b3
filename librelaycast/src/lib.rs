//! Relaycast - multilingual channel relay
//!
//! Takes posts authored in one source channel and republishes them to many
//! destination channels, each in its own language and with its own branding.
//! Translation runs across two providers and a pool of rotating credentials;
//! media is re-rendered per destination on a bounded worker pool.

pub mod chat;
pub mod config;
pub mod credentials;
pub mod db;
pub mod destinations;
pub mod error;
pub mod fanout;
pub mod health;
pub mod intake;
pub mod ledger;
pub mod logging;
pub mod providers;
pub mod render;
pub mod service;
pub mod settings;
pub mod translation;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use credentials::CredentialPool;
pub use db::Database;
pub use error::{RelayError, Result};
pub use fanout::{DeliveryReport, Fanout};
pub use service::RelayService;
pub use types::{Credential, CredentialStatus, Destination, Language, Provider, SourcePost};
