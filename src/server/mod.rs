//! Acceptor and dialer
//!
//! Socket setup and the background accept/connect tasks feeding the manager.

mod dialer;
mod listener;

pub use dialer::{connect, resolve};
pub use listener::bind;

pub(crate) use dialer::connect_in_background;
pub(crate) use listener::Listener;
