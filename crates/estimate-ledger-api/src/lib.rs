//! Live aggregation of versioned estimate child records.
//!
//! [`Aggregator`] pulls every stored revision of an estimate from a
//! [`estimate_ledger_client::VersionSource`], merges it with the caller's draft,
//! and publishes the result on a watch channel.

mod aggregator;
mod config;
mod notice;
mod poller;

pub use aggregator::{AggregateState, AggregateView, Aggregator, Phase, RefreshOutcome};
pub use config::{LedgerConfig, DEFAULT_BASE_URL, DEFAULT_POLL_INTERVAL_SECS};
pub use notice::{report, Notice, NoticeLevel, Origin, NETWORK_FAILURE_MESSAGE};
pub use poller::{spawn_poller, PollHandle};
