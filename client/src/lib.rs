//! # Road Hazard Client Library
//!
//! Talks to a hazard server over its line protocol: report hazards, tell the
//! server a hazard is gone, and fetch the hazards around a position.
//!
//! ## Connection Handling
//!
//! A [`Client`] opens its TCP connection on first use and keeps it for later
//! requests. Any I/O error, timeout or malformed answer drops the connection
//! and is returned to the caller; the next request reconnects. Each answer
//! line must arrive within the configured timeout (10 seconds by default).
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use client::{Client, DEFAULT_TIMEOUT};
//! use shared::{Poi, PoiType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::connect("127.0.0.1:6996", DEFAULT_TIMEOUT).await?;
//!
//!     let camera = Poi::new(PoiType::FixedSpeedCam, 48.8566, 2.3522, Utc::now());
//!     client.submit(&camera).await?;
//!
//!     for poi in client.get_infos(48.8566, 2.3522).await? {
//!         println!("{}", poi);
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{Client, ClientError, DEFAULT_TIMEOUT};
