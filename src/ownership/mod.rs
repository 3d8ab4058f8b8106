//! Ownership Module
//!
//! Distributed reference counting. The worker that creates an object owns its count for
//! the object's whole life; everyone else is a borrower and reports changes to the owner.
//!
//! ## Core Concepts
//! - **OwnershipTable**: The owner's authoritative records (local handles, task pins,
//!   borrower edges, container pins).
//! - **BorrowLedger**: A borrower's local handle counts, reported on 0 <-> 1 transitions.
//! - **Protocol**: Sequenced borrower reports and pin changes, delivered FIFO per owner.
//! - **ObjectHandle**: The counted reference user code holds.
//!
//! An object is reclaimed exactly when the sum of all four kinds of references reaches
//! zero, and never while one is outstanding.

pub mod counter;
pub mod directory;
pub mod handle;
pub mod ledger;
pub mod protocol;
pub mod table;
pub mod types;

#[cfg(test)]
mod tests;
