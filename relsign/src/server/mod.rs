// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

pub mod acl;
pub mod cleanup;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub(crate) mod handlers;
pub mod kv;
pub mod nonce;
pub mod process;
pub mod service;
pub mod store;
pub mod token;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{Config, Secrets};
