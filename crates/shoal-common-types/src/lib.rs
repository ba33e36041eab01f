// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Domain model shared by the Shoal authority and exit nodes.
//!
//! The authority owns [`User`] and [`Server`] records; nodes only ever see
//! the [`UserSnapshot`] projection carried inside a [`SyncEnvelope`].

pub mod response;
pub mod server;
pub mod sync;
pub mod user;

pub use response::ApiResponse;
pub use server::{
	Server, ServerFeatures, ServerId, ServerIdError, ServerStatus, VpnTransport,
};
pub use sync::{RegistryDigest, RegistryDigestEntry, SyncAction, SyncEnvelope, UserSnapshot};
pub use user::{User, UserTier};
