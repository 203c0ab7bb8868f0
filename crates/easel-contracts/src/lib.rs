pub mod chat;
pub mod events;
pub mod layout;
pub mod models;
pub mod providers;
pub mod request;
pub mod session;

pub use request::{Axis, RequestKind};
