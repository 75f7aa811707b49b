//! A WebDAV server library that exposes hierarchical resource
//! backends over HTTP as mountable shares.
//!
//! The building blocks:
//!
//! - [`DavRouter`]: resolves a request to a share, authenticates,
//!   binds a per-request batch, and dispatches to the method handlers.
//! - [`DavHandler`]: the RFC 4918 method engine for a single share.
//! - [`fs::DavProvider`]: the resource-tree backend trait, with
//!   [`localfs::LocalFs`] (plain filesystem), [`repofs::RepoFs`]
//!   (content-addressed, transactional) and [`rootfs::RootFs`]
//!   (synthetic share listing) as implementations.
//! - [`memls::MemLs`]: RFC 4918 section 6 lock manager.
//! - [`propman::MemPm`]: dead-property storage.
//! - [`auth::HttpAuthenticator`]: Basic and Digest authentication.
//!
//! A minimal server:
//!
//! ```no_run
//! use davshare::{memls::MemLs, propman::MemPm, repofs::RepoFs, DavRouter};
//!
//! let router = DavRouter::builder()
//!     .share("/", RepoFs::new())
//!     .locksystem(MemLs::new())
//!     .propsystem(MemPm::new())
//!     .build();
//! // hand router.handle(request) to your HTTP server.
//! ```
mod async_stream;
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
mod tree;
mod util;
mod xmltree_ext;

pub mod auth;
pub mod body;
pub mod config;
pub mod davheaders;
pub mod davpath;
pub mod fs;
pub mod localfs;
pub mod ls;
pub mod memls;
pub mod propman;
pub mod repofs;
pub mod rootfs;
pub mod router;

pub use crate::davhandler::{DavConfig, DavHandler};
pub use crate::router::{DavRouter, DavRouterConfig};
pub use crate::util::{DavMethod, DavMethodSet};

pub(crate) use crate::errors::DavError;

pub(crate) type DavResult<T> = std::result::Result<T, DavError>;
