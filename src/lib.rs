// Copyright 2026 Pagespec Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pagespec library — drives a browser session against a page, expands its
//! disclosure UI, observes the resulting mutations and network traffic, and
//! distills the run into a machine-usable extraction description.
//!
//! The library crate exposes the core modules for integration testing.

pub mod config;
pub mod coordinator;
pub mod element;
pub mod error;
pub mod expansion;
pub mod monitor;
pub mod protection;
pub mod report;
pub mod session;
pub mod snapshot;
pub mod stability;
pub mod stealth;
