//! Low-level primitives shared by the log and the archiver.
//!
//! Includes positional file I/O and the wake-up events blocking waits are
//! built on.

/// Concurrency primitives and synchronization.
///
/// Generation-counting events and the spin-then-sleep polling loop.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Positional reads and writes behind a trait so tests can inject faults.
pub mod io;
