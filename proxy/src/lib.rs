#![allow(clippy::too_many_arguments)]

pub use self::account::Account;
pub use self::auth::Authorization;
pub use self::config::Config;
pub use self::event::Event;

pub mod account;
pub mod active;
pub mod auth;
pub mod backbuffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod environment;
pub mod event;
pub mod gate;
pub mod handler;
pub mod isupport;
pub mod listmode;
pub mod login;
pub mod mode;
pub mod parser;
pub mod reply;
pub mod requeue;
pub mod server;
pub mod stream;
