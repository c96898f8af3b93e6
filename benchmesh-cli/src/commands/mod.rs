// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod results;
pub mod run;
pub mod validate;
pub mod workers;
