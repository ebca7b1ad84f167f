//! Type definitions for the tablet query service.

mod ids;
mod keyrange;

pub use ids::{SessionId, TransactionId};
pub use keyrange::KeyRange;
