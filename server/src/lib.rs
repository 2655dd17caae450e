//! # Road Hazard Server Library
//!
//! Authoritative side of the hazard reporting service. Clients connect over
//! TCP and speak a line-oriented text protocol to report hazards (speed
//! cameras, accidents, roadworks), to say that a hazard they were warned about
//! is gone, and to ask which hazards are around them.
//!
//! ## Core Responsibilities
//!
//! ### Single Source of Truth
//! Every report lives in one [`store::PoiStore`]. Mutations and the
//! notifications they trigger are serialized behind one lock, so observers
//! (autosave, future displays) see changes in exactly the order they
//! happened.
//!
//! ### Vote Counting
//! Clients are anonymous, so a report's credibility is a pair of counters.
//! [`consensus::ConsensusPolicy`] folds nearby duplicate submissions into
//! confirmations of the existing report and removes a report once enough
//! clients said they no longer see it.
//!
//! ### Persistence
//! The active reports and the history of removed ones are saved to an XML
//! file and loaded back on startup. A file that fails to load is rejected as
//! a whole.
//!
//! ## Module Organization
//!
//! - `store`: active and removed collections, area queries, listeners
//! - `consensus`: submit / not-seen rules and the `GET_INFOS` radius
//! - `network`: accept loop, per-connection dispatch, idle timeout, shutdown
//! - `client_manager`: session bookkeeping and connection statistics
//! - `persistence`: XML save and load
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::consensus::{ConsensusConfig, ConsensusPolicy};
//! use server::network::{Server, ServerConfig};
//! use server::store::PoiStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(PoiStore::new());
//!     let policy = ConsensusPolicy::new(store, ConsensusConfig::default());
//!
//!     let server = Server::bind(ServerConfig::default(), policy).await?;
//!     server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Failure Isolation
//!
//! A malformed line, an I/O error or an idle timeout closes only the
//! connection it happened on. A listener that fails or panics is logged and
//! skipped; the mutation that triggered it still stands.

pub mod client_manager;
pub mod consensus;
pub mod network;
pub mod persistence;
pub mod store;
