//! kslink-dispatch: routes deferred keystore requests to per-keystore workers
//!
//! ```text
//! caller ── Request ──► Dispatcher::dispatch ──► queue[servername] ──► worker thread
//!    ▲                                                                     │
//!    └──── get_response (condvar) ◄──── Request completed ◄── KeystoreLink ┘
//! ```
//!
//! A request may carry a completion queue; several requests sharing one
//! queue give "first responder wins" across keystores.

pub mod command;
pub mod dispatcher;
pub mod kek;
pub mod relay;
pub mod request;

pub use command::Command;
pub use dispatcher::Dispatcher;
pub use kek::{KekProvider, RoutedCipher};
pub use request::{completion_queue, Request};
