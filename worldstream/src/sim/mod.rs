//! In-process collaborators for tests, benchmarks and the `simulate` command.
//!
//! [`MemoryLedger`] and [`MemoryFetcher`] stand in for the ledger and the
//! artifact store; [`SyntheticWorld`] fills both from a seed.

mod fetcher;
mod ledger;
mod world;

pub use fetcher::MemoryFetcher;
pub use ledger::{LedgerCalls, MemoryLedger};
pub use world::{SyntheticWorld, SyntheticWorldConfig};
