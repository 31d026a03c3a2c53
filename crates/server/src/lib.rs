//! Transport and I/O adapters around the adventure engine: the line-delimited
//! JSON socket server and the image-generation provider with its
//! content-addressed cache.

pub mod image;
pub mod protocol;
pub mod server;

pub use image::{GeneratorOptions, ImageGenerator, ImageProvider};
pub use protocol::{ClientCommand, ServerEvent};
pub use server::run_server;
