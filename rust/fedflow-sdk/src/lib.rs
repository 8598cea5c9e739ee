#![cfg_attr(docsrs, feature(doc_cfg))]
//! A client of the fedflow director API.
//!
//! [`Client`] covers both sides of the director: the envoy calls (connect, heartbeat, waiting for
//! experiments and downloading their archives) and the frontend calls of data scientists
//! (submitting, listing, inspecting and removing experiments).
//!
//! ```no_run
//! # async fn run() -> Result<(), fedflow_sdk::ClientError> {
//! let client = fedflow_sdk::Client::new("http://127.0.0.1:50051")?.with_client_id("alice");
//! let accepted = client
//!     .set_new_experiment("exp1".into(), vec!["w1".into(), "w2".into()], "plan.zip")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;

pub use self::client::{Client, ClientError};
