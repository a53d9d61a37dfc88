pub mod manager;

pub use manager::{Stream, StreamManager};
