//! Resource Resolver: symbolic target → concrete pod name, per spec §4.2.

mod cache;
mod resolve;

pub use resolve::ResourceResolver;
