// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Exit-node daemon: local user registry, tunnel peer plumbing, credential
//! verification, and periodic load reporting to the authority.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod peers;
pub mod registry;
pub mod report;
pub mod routes;
pub mod scorer;

pub use config::{load_config, ConfigError, NodeConfig};
pub use error::{NodeError, Result};
