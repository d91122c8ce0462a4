mod base;
pub mod twitter;

pub use base::{Author, Post, PostMedia, PostMetrics, ReferenceKind, ReferencedPost};

#[cfg(test)]
pub(crate) use base::fixtures;
