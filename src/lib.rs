pub mod bft;

pub use bft::error;
