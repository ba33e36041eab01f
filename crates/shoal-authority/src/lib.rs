// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Fleet authority: user/server directory, config bundle issuance, and
//! push-based synchronization to exit nodes.

pub mod bundle;
pub mod cache;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod reconcile;
pub mod routes;
pub mod service;
pub mod sync;

pub use config::{load_config, AuthorityConfig, ConfigError};
pub use error::{AuthorityError, Result};
pub use service::AuthorityService;
