//! Serialization primitives shared by the program container.

pub mod encoding;
