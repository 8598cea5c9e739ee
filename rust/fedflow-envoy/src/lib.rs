#![cfg_attr(docsrs, feature(doc_cfg))]
//! # The fedflow envoy
//!
//! An envoy runs next to the data of a collaborator. It registers with the director, reports
//! its liveness with periodic heartbeats and, one experiment at a time, waits for an
//! assignment, downloads the experiment archive and trains locally.
//!
//! The heartbeat and the work loop run concurrently and share only the
//! `is_experiment_running` flag.

pub mod client;
pub mod envoy;
pub mod settings;
pub mod trainer;

pub use self::{
    client::DirectorClient,
    envoy::{Envoy, EnvoyError},
    trainer::{CommandTrainer, LocalTrainer},
};
