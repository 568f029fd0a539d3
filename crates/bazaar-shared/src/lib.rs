//! # bazaar-shared
//!
//! Identifiers, models and the error taxonomy shared by the chat core and
//! its REST client.

pub mod constants;
pub mod error;
pub mod models;
pub mod types;

pub use error::{ChatError, Result};
pub use models::*;
pub use types::{MessageId, RoomId, UserId};
