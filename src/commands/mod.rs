pub mod run;
pub mod status;

// Re-export command functions for convenience
pub use run::{resume, start};
pub use status::status;
