//! A minimal net/rpc-style RPC core: a length-framed binary codec, a
//! JSON handshake that negotiates it, a service registry addressed by
//! `"Service.Method"`, and a server dispatch loop / client call
//! multiplexer built on top.
//!
//! A typical server:
//!
//! ```no_run
//! use std::sync::Arc;
//! use minirpc::{Server, ServiceBuilder};
//!
//! struct Foo;
//!
//! async fn sum(_foo: Arc<Foo>, args: (i64, i64)) -> Result<i64, String> {
//!     Ok(args.0 + args.1)
//! }
//!
//! # async fn run() -> Result<(), minirpc::Error> {
//! let server = Server::builder()
//!     .register("Foo", ServiceBuilder::new("Foo", Foo).method("Sum", sum).build())?
//!     .build();
//! server.accept("tcp@127.0.0.1:8000").await
//! # }
//! ```
//!
//! and a client:
//!
//! ```no_run
//! # async fn run() -> Result<(), minirpc::Error> {
//! let client = minirpc::Client::dial("tcp@127.0.0.1:8000").await?;
//! let reply: i64 = client.call("Foo.Sum", (1i64, 1i64)).await?;
//! assert_eq!(reply, 2);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod error;
pub mod handshake;
pub mod message;
pub mod server;
pub mod service;
pub mod transport;

pub use client::{Client, PendingCall};
pub use error::Error;
pub use handshake::Options;
pub use message::{Header, Seq};
pub use server::{Server, ServerBuilder};
pub use service::{Service, ServiceBuilder, ServiceRegistry};
