//! A WebDAV (RFC 4918) server library, plus a channel multiplexer that
//! tunnels the TCP side of the share over a single bidirectional byte
//! stream such as a virtio serial port.
//!
//! The [`DavHandler`] processes one `http::Request` at a time against a
//! filesystem backend ([`localfs::LocalFs`] for a plain directory,
//! [`virtualfs::VirtualFs`] for an overlay of shared folders), with
//! WebDAV class 2 locking provided by [`locks::LockManager`].
//!
//! The [`mux`] module implements the channel multiplexer, built on the
//! ordered write queue in [`outq`].

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod conditional;
mod davhandler;
mod errors;
mod handle_copymove;
mod handle_delete;
mod handle_gethead;
mod handle_lock;
mod handle_mkcol;
mod handle_options;
mod handle_props;
mod handle_put;
mod multierror;
mod pathreg;
mod util;
mod xmltree_ext;

pub mod body;
pub mod davheaders;
pub mod davpath;
pub mod fs;
pub mod localfs;
pub mod locks;
pub mod mux;
pub mod outq;
pub mod virtualfs;

pub(crate) use crate::errors::DavError;

pub(crate) type DavResult<T> = Result<T, DavError>;

pub use crate::davhandler::{DavConfig, DavHandler};
pub use crate::util::{DavMethod, DavMethodSet};
