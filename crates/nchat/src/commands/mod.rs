pub mod account;
pub mod chat;
pub mod identity;
pub mod message;
pub mod relays;

mod room;
