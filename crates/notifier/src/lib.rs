//! Notification delivery engine.
//!
//! - `channels`: provider per delivery medium and the channel registry
//! - `policy`: backoff, TTL and retry eligibility
//! - `delivery`: append-only attempt history
//! - `dispatch`: fan-out of one notification and its state transition
//! - `batch`: dispatch over many ids with throttling and cleanup
//! - `receipts`: delivery/read confirmations
//! - `store`: repository and target registry (Postgres, in-memory)
//! - `queue` / `worker`: Redis job queue runtime

pub mod batch;
pub mod channels;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod policy;
pub mod queue;
pub mod receipts;
pub mod store;
pub mod worker;
