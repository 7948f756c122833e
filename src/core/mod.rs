//! Storage layer: block mapping, stores, queueing and handles

pub mod backend;
pub mod blocks;
pub mod handle;
pub mod meta;
pub mod queue;
pub mod registry;
pub mod validation;
