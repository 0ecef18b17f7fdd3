//! Core library for forgescout, a code-host integration service.
//!
//! The library is synchronous: remote access goes through the blocking
//! [`api::HostApi`] trait behind a [`retry::RetryingClient`], and the only
//! background concurrency is the status notifier's worker pool. The daemon
//! crate layers async HTTP serving on top.
//!
//! Subsystems:
//! - [`model`]: heads and revisions, the identity layer everything else
//!   hangs off.
//! - [`context`] and [`request`]: trait-driven discovery of branches,
//!   change requests and tags.
//! - [`hooks`] and [`webhook`]: outbound hook registration and inbound
//!   event parsing.
//! - [`notify`]: race-free asynchronous build status publication.

pub mod api;
pub mod context;
pub mod error;
pub mod hooks;
pub mod mock;
pub mod model;
pub mod notify;
pub mod request;
pub mod rest;
pub mod retry;
pub mod webhook;

pub use api::HostApi;
pub use context::{DiscoveryContext, DiscoveryTrait, Trust, WebhookMode};
pub use error::{DiscoveryError, RemoteError};
pub use model::{Head, Revision};
pub use notify::StatusNotifier;
pub use request::{DiscoveryRequest, HeadObserver};
pub use rest::RestHost;
pub use retry::{RetryPolicy, RetryingClient};
