//! Queue monitor and build-graph construction core of kiln.
//!
//! The monitor watches the database build queue, expands each queued build
//! into a deduplicated graph of derivation build [`Step`]s, and hands steps
//! whose dependencies are all satisfied to the [`Dispatcher`]. Builds that
//! can be decided without running anything (already built, garbage-collected
//! derivation, cached failure, no capable machine) are completed in the
//! database on the spot.

pub mod build;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod expand;
pub mod jobset;
pub mod machine;
pub mod monitor;
pub mod state;
pub mod step;

#[cfg(test)]
pub(crate) mod testing;

pub use build::Build;
pub use config::Config;
pub use dispatch::{ChannelDispatcher, Dispatcher};
pub use error::{QueueError, QueueResult};
pub use jobset::Jobset;
pub use machine::Machine;
pub use state::State;
pub use step::{Step, StepState};
