//! Chat sessions and the local console.
//!
//! Every stream between two peers becomes a [`ChatSession`]. Sessions are
//! tracked by the [`SessionManager`] and share one [`Console`].

pub mod chat;
pub mod console;
pub mod manager;

pub use chat::*;
pub use console::*;
pub use manager::*;
