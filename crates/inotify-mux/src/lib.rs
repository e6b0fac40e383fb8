//!
//! # Inotify Multiplexer
//!
//! Turns one Linux inotify channel, carrying interleaved binary records for many watched paths,
//! into per-watch callbacks.
//!
//! A reader task waits on the kernel channel, decodes each read into a batch of raw records and
//! pushes it on a bounded queue. A single dispatcher task drains that queue, classifies every
//! record into an [`Event`] and invokes the handler registered for its watch, in exactly the
//! order the kernel emitted them. Records for watches nobody is subscribed to, queue overflows
//! among them, go to a fallback handler given at [`Monitor::init`].
//!
//! ## Basic example
//!
//! ```no_run
//! use sd_inotify_mux::{Event, EventVariety, Monitor, MonitorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sd_inotify_mux::Error> {
//!     let monitor = Monitor::init(MonitorConfig::default(), |wd, event| {
//!         eprintln!("unclaimed event on {wd}: {event:?}");
//!     })?;
//!
//!     monitor.add_watch(&[EventVariety::Create, EventVariety::Delete], "/tmp", |event| {
//!         if let Event::Created { name, .. } = event {
//!             println!("created {name:?}");
//!         }
//!     })?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     monitor.shutdown().await;
//!
//!     Ok(())
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod config;
mod error;
mod event;
mod kernel;
mod monitor;
mod pipeline;
mod record;
mod registry;
mod variety;

pub use config::{MonitorConfig, OverflowPolicy};
pub use error::{ClassifyError, DecodeError, Error, FileIOError, ResourceLimit, Result};
pub use event::Event;
pub use kernel::{InotifyChannel, KernelChannel};
pub use monitor::{Monitor, MonitorHandle};
pub use pipeline::{FallbackHandler, MonitorStatus};
pub use record::{decode, RawRecord, Records, WatchHandle, HEADER_SIZE, MAX_RECORD_SIZE};
pub use registry::{Handler, Subscription, WatchRegistry};
pub use variety::EventVariety;
