//! Request-scoped erasure of user identities.
//!
//! A run removes a set of identities from a relational store, through a
//! reviewed deletion script executed once per chunk, and then from an
//! external analytics service through its batch deletion API. The outcome is
//! captured in a [`report::Report`].

pub mod config;
pub mod db;
pub mod identifiers;
#[cfg(feature = "cli")]
pub mod observability;
pub mod purge;
pub mod report;
pub mod run;

#[cfg(test)]
mod tests;
