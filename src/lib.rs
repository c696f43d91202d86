mod client;
mod error;
mod model;
pub mod transport;

pub use client::{ACROMINE_ENDPOINT, Completion, LookupClient, LookupOutcome};
pub use error::LookupError;
pub use model::LongForm;
