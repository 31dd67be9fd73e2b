//! Leader election among same-origin browser contexts sharing a channel.
//!
//! # Protocol Overview
//!
//! **Applying:**
//! 1. Candidate broadcasts `APPLY{token, dictator}` with a fresh token
//! 2. Waits one response window, then repeats `APPLY` as a liveness re-check
//! 3. Waits a second window; if nothing made it concede, it is leader and broadcasts `TELL`
//!
//! **Conceding:** an applicant gives up when it hears a `TELL` from a leader, or
//! an `APPLY` whose [`Precedence`] beats its own (dictators first, then tokens).
//!
//! **Leading:** the leader answers every `APPLY` with `TELL`, except that a
//! non-dictator leader steps down on a dictator's `APPLY` (coup).
//!
//! **Failover:** a dying elector broadcasts `DEATH`. Anyone awaiting
//! leadership re-applies on `DEATH` and on a fallback interval, which also
//! covers lost messages.

pub mod config;
pub mod elector;
pub mod leader;
pub mod messages;

pub use config::{DEFAULT_FALLBACK_INTERVAL, ElectionConfig};
pub use elector::{DeposeReason, ElectionEffect, Elector, Phase};
pub use leader::{ElectionError, LeaderElection, LeadershipHandlers};
pub use messages::{ElectionAction, ElectionMessage, ElectionToken, Precedence};
