// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

pub mod envelope;
pub mod identity;
pub mod metrics;
pub mod plan_generator;
pub mod quota_guard;
pub mod server;
