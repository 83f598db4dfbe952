//! keel operator - baremetal Kubernetes cluster lifecycle management
//!
//! The binary in `main.rs` parses [`config::Cli`] and hands the resulting
//! [`config::OperatorConfig`] to [`controller_runner`].

pub mod config;
pub mod controller_runner;
