#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedflow core
//!
//! Types shared by the fedflow director, its envoys and the submission frontend:
//!
//! - [`ExperimentStatus`]: the lifecycle of a submitted federated training run.
//! - [`api`]: the request and response bodies of the director API.
//! - [`settings`]: the settings sections the director and the envoys have in common.
//! - [`transfer`]: the chunk framing used to stream experiment archives in both directions.
//!
//! A director sequences experiments one at a time. Envoys (the worker sites holding the
//! private data) long-poll the director for the name of the experiment they should run next,
//! download its archive and train locally, while reporting their liveness with periodic
//! heartbeats.

pub mod api;
pub mod common;
pub mod settings;
pub mod transfer;

pub use self::{
    common::{EnvoyName, ExperimentName, ExperimentStatus, StatusTransitionError},
    transfer::TransferError,
};
