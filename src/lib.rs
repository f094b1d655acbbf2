//! A small HTTP/1.0 file server built around an edge-triggered, one-shot
//! `epoll` loop.
//!
//! One thread waits on the [`Poller`]. Events on the listening socket are
//! handled right there by the [`Acceptor`]; events on a peer hand the
//! [`Connection`] to a worker through a [`Dispatch`] strategy. Peers are
//! registered one-shot, so the kernel stays quiet about a connection while a
//! worker holds it, and the worker gives it back with [`Poller::rearm`] only
//! after draining everything that was available.

pub mod acceptor;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod http;
pub mod poller;
pub mod server;
pub mod worker;

pub use acceptor::Acceptor;
pub use config::ServerConfig;
pub use connection::Connection;
pub use dispatch::{Dispatch, Strategy};
pub use error::{Error, Result};
pub use poller::Poller;
pub use server::{serve, Server};
