//! Background worker process: claims jobs from the durable queue and
//! drives them to completion via the rebalance planner or settlement
//! executor in `treasury_core`.

pub mod runner;

pub use runner::WorkerLoop;
