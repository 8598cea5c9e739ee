#![cfg_attr(docsrs, feature(doc_cfg))]
//! # The fedflow director
//!
//! The director coordinates federated experiments between data scientists and envoys. A data
//! scientist submits an experiment archive together with the envoys that should collaborate on
//! it. The director queues the experiment, runs one experiment at a time through an aggregator
//! and hands each collaborating envoy the name of the experiment it should train on.
//!
//! ```text
//!   submit ──► pending queue ──► active slot ──► archive
//!                                     │
//!                                     ├──► aggregator
//!                                     └──► assignment queue per envoy ──► envoy long poll
//! ```
//!
//! Envoys report their liveness with periodic heartbeats. An envoy is considered online as long
//! as its last heartbeat is not older than twice the health check period.
//!
//! The API is served over HTTP by [`rest::serve`]. With the `tls` feature, it can be served over
//! mutually authenticated TLS, in which case callers are identified by the common name of their
//! client certificate.

pub mod assignments;
pub mod director;
pub mod envoys;
pub mod experiment;
pub mod registry;
pub mod rest;
pub mod review;
pub mod runner;
pub mod settings;
pub mod workspace;

pub use self::{
    director::{Director, DirectorBuilder, DirectorError},
    experiment::Experiment,
    registry::{ActiveExperiment, ExperimentRegistry, RegistryError},
};
