//! Post-mortem log and state collection for Kubernetes clusters, built on [`kube`]
//!
//! `kubedump` gathers three classes of evidence from a running cluster into a
//! local artifacts directory:
//!
//! - **Node logs**, pulled over SSH from every node (see [`nodes`]).
//! - **Container logs**, fetched from the API server for every container of
//!   every pod, including the previous instance where one exists (see
//!   [`pods`]).
//! - **Resource state**, listed for every discoverable resource kind in every
//!   namespace and written as JSON or YAML with secrets redacted (see
//!   [`resources`]).
//!
//! Each collector is a one-shot snapshot driven by a
//! [`CancellationToken`](tokio_util::sync::CancellationToken). Per-item
//! failures never abort a run: the node collector logs them and the pod and
//! resource collectors return them together as an [`Errors`] value once all
//! other work has completed.
//!
//! # Crate Features
//!
//! - **cli**: Builds the `kubedump` binary and enables [`clap`] support for
//!   the argument types in this crate.
//! - **ssh**: Enables the [`ssh2`]-backed [`SshDialer`](ssh::SshDialer).
//! - **rustls-tls** / **openssl-tls**: Selects the TLS implementation used
//!   by the Kubernetes client.
//!
//! [`kube`]: https://github.com/kube-rs/kube-rs
//! [`clap`]: https://crates.io/crates/clap
//! [`ssh2`]: https://crates.io/crates/ssh2

#![deny(rust_2018_idioms)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod api;
pub mod artifacts;
pub mod client;
pub mod discovery;
pub mod errors;
pub mod log;
pub mod nodes;
pub mod pods;
mod pool;
pub mod resources;
pub mod shutdown;
pub mod ssh;

pub use self::api::KubeApi;
pub use self::artifacts::{Layout, OutputFormat};
pub use self::client::ClientArgs;
pub use self::errors::{Error, Errors, ItemError};
pub use self::log::{LogArgs, LogFilter, LogFormat, LogInitError};
pub use self::nodes::{NodeDumpConfig, NodeDumper};
pub use self::pods::{PodLogConfig, PodLogDumper};
pub use self::resources::{ResourceDumpConfig, ResourceDumper};
