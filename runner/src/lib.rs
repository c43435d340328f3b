//! Autonomous goal runner: a verification-gated attempt supervisor plus a
//! recursive read path for contexts larger than one worker can hold.
//!
//! The supervisor ([`supervise`]) retries an external worker against a
//! persisted goal until an external verification gate passes or the attempt
//! budget runs out. The read path ([`analysis`]) splits a loaded context
//! into chunks, delegates each to a stateless sub-worker, and synthesizes
//! the structured results into a cited answer.
//!
//! [`core`] is pure logic; everything that touches the filesystem or spawns
//! processes lives in [`io`] behind traits the tests script.

pub mod analysis;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pool;
pub mod session;
pub mod supervise;

#[cfg(feature = "test-support")]
pub mod test_support;
