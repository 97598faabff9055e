pub mod agent;
pub mod backend;
pub mod common;
pub mod manifest;

#[cfg(test)]
pub(crate) mod tests;

pub type Error = crate::common::error::MetaqError;
pub type Result<T> = std::result::Result<T, Error>;

pub type Map<K, V> = std::collections::HashMap<K, V>;
pub type Set<T> = std::collections::HashSet<T>;

pub const METAQ_VERSION: &str = env!("CARGO_PKG_VERSION");
