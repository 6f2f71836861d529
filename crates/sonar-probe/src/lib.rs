//! sonar-probe: presence prober for messaging networks.
//!
//! Sends a revoke of an action that never existed toward each device of a
//! target, then times the server and device acknowledgements the revoke
//! triggers. Probes run concurrently in rounds; results go to result sinks.

pub mod config;
pub mod error;
pub mod persist;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod target;
