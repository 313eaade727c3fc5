// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Durable state: pilots, memories, accounts. Single writer connection
//! guarded by a mutex; every mutation is totally ordered.

mod error;
mod models;
mod schema;
mod store;

pub use error::StoreError;
pub use models::{Account, Memory, Mysis, MysisState, Role, Source};
pub use store::Store;
