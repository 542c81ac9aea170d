//! Host-side message envelope.
//!
//! The bus itself moves opaque bytes. Applications that want to know who sent
//! a broadcast wrap their payload in a [`ClusterMessage`] and turn it into
//! bytes with a [`MessageFormatter`]. Since every node also receives its own
//! broadcasts, receivers use [`ClusterMessage::is_from`] to skip them.

pub mod envelope;
pub mod formatter;

pub use envelope::{ClusterMemberInfo, ClusterMessage};
pub use formatter::{JsonMessageFormatter, MessageFormatter};

#[cfg(test)]
mod tests;
