#![doc = include_str!("RUSTDOC.md")]

pub mod analytics;
pub mod logger;
pub mod platform;
pub mod util;

#[cfg(test)]
pub mod test_support;
