// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Agent configuration with validation.

use crate::error::AgentError;

/// Configuration for the trellis agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum concurrent clients (default: 128).
    pub max_clients: usize,
    /// Client timeout in milliseconds (default: 30000).
    pub client_timeout_ms: u64,
    /// Heartbeat period in milliseconds for reliable lanes (default: 200).
    pub heartbeat_period_ms: u64,
    /// Maximum wire message size in bytes (default: 512, typical MCU limit).
    pub max_message_size: usize,
    /// Reliable stream window depth (default: 16).
    pub reliable_depth: u16,
    /// Best-effort stream queue depth (default: 16).
    pub best_effort_depth: usize,
    /// Worker threads draining the scheduler (default: 2).
    pub workers: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_clients: 128,
            client_timeout_ms: 30_000,
            heartbeat_period_ms: 200,
            max_message_size: 512,
            reliable_depth: 16,
            best_effort_depth: 16,
            workers: 2,
        }
    }
}

impl AgentConfig {
    /// Validate configuration. Returns Ok(()) if valid.
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_clients == 0 {
            return Err(AgentError::ConfigError("max_clients must be > 0".into()));
        }
        if self.client_timeout_ms == 0 {
            return Err(AgentError::ConfigError(
                "client_timeout_ms must be > 0".into(),
            ));
        }
        if self.heartbeat_period_ms == 0 {
            return Err(AgentError::ConfigError(
                "heartbeat_period_ms must be > 0".into(),
            ));
        }
        // Must fit a message header + submessage header + minimal payload.
        if self.max_message_size < 16 {
            return Err(AgentError::ConfigError(
                "max_message_size must be >= 16".into(),
            ));
        }
        // The framing length prefix is 2 bytes.
        if self.max_message_size > usize::from(u16::MAX) {
            return Err(AgentError::ConfigError(
                "max_message_size must be <= 65535".into(),
            ));
        }
        if self.reliable_depth == 0 || self.reliable_depth > 0x4000 {
            return Err(AgentError::ConfigError(
                "reliable_depth must be in 1..=16384".into(),
            ));
        }
        if self.best_effort_depth == 0 {
            return Err(AgentError::ConfigError(
                "best_effort_depth must be > 0".into(),
            ));
        }
        if self.workers == 0 {
            return Err(AgentError::ConfigError("workers must be > 0".into()));
        }
        Ok(())
    }
}
