//! Ready-made stacks built from the primitives of this crate.
pub mod mastodon;
