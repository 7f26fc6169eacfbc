//! Consolidated test modules.
//!
//! This module contains end-to-end erasure runs through the real purge store
//! and HTTP client.
