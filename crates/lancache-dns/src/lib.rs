//! Selective DNS redirector
//!
//! A UDP resolver that answers A queries for one intercepted hostname
//! with the mirror's own address and transparently forwards every
//! other query to the configured upstream resolver.

pub mod error;
pub mod server;

pub use error::DnsError;
pub use server::{DnsConfig, DnsServer};
