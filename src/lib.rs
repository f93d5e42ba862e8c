//! Waitlist and reservation-hold allocation for scarce, unit-quantity
//! resources such as library book copies.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod priority;
pub mod seed;
pub mod standing;
pub mod sweeper;
pub mod waitlist;
pub mod wal;
