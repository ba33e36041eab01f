// Copyright (c) 2025 Shoal Authors. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The `{success, message, data?}` envelope both daemons answer with.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T = serde_json::Value> {
	pub success: bool,
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,
}

impl<T> ApiResponse<T> {
	pub fn ok(message: impl Into<String>) -> Self {
		ApiResponse {
			success: true,
			message: message.into(),
			data: None,
		}
	}

	pub fn ok_with(message: impl Into<String>, data: T) -> Self {
		ApiResponse {
			success: true,
			message: message.into(),
			data: Some(data),
		}
	}

	pub fn error(message: impl Into<String>) -> Self {
		ApiResponse {
			success: false,
			message: message.into(),
			data: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn data_is_omitted_when_absent() {
		let response: ApiResponse<()> = ApiResponse::error("nope");
		let json = serde_json::to_value(&response).unwrap();
		assert_eq!(json["success"], false);
		assert!(json.get("data").is_none());
	}
}
