//! Command building for tc invocations.

pub mod builder;

pub use builder::{NetemArgs, QdiscType, TcCommandBuilder, TcObject, TcOperation, TcTarget};
