/*
 * 5D Labs Agent Platform - GPU Operator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! GPU operator core library
//!
//! Rolls AMD GPU driver upgrades across the nodes a `DeviceConfig` selects
//! and dispatches Argo remediation workflows for nodes reporting unhealthy
//! GPU conditions.

pub mod clock;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crds;
pub mod error;
pub mod nodes;
pub mod remediation;
pub mod upgrade;
pub mod wait;

// Re-export commonly used types
pub use cluster::{ClusterClient, KubeClusterClient};
pub use config::{OperatorConfig, ProcessSettings};
pub use controller::{Context, Reconciler};
pub use crds::{DeviceConfig, DeviceConfigSpec, DeviceConfigStatus, RemediationWorkflowStatus};
pub use error::{Error, Result};
pub use remediation::RemediationDispatcher;
pub use upgrade::UpgradeManager;
