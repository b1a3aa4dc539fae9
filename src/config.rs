//! Process configuration loaded once at startup from environment
//! variables, per the external interfaces the splicer is wired to.

use crate::error::{RelayError, Result};
use std::time::Duration;

/// Default path for the camera (SRT-origin) input pipe.
pub const DEFAULT_CAMERA_PIPE: &str = "/pipe/camera.ts";
/// Default path for the drone (RTMP-origin) input pipe.
pub const DEFAULT_DRONE_PIPE: &str = "/pipe/drone.ts";
/// Default path for the looping offline fallback input pipe.
pub const DEFAULT_FALLBACK_PIPE: &str = "/pipe/fallback.ts";
/// Default path for the spliced output pipe.
pub const DEFAULT_OUTPUT_PIPE: &str = "/pipe/ts_output.pipe";
/// Default control API port.
pub const DEFAULT_HTTP_PORT: u16 = 8091;
/// Default per-source buffer bound, in packets (~3s at 2 Mbps).
pub const DEFAULT_BUFFER_PACKETS: usize = 1500;
/// Default PAT/PMT reinjection interval in milliseconds.
pub const DEFAULT_PSI_REPEAT_MS: u64 = 1000;

/// Process-wide configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path to the camera input named pipe (`CAMERA_PIPE`).
    pub camera_pipe: String,
    /// Path to the drone input named pipe (`DRONE_PIPE`).
    pub drone_pipe: String,
    /// Path to the fallback input named pipe (`FALLBACK_PIPE`).
    pub fallback_pipe: String,
    /// Path to the output named pipe (`OUTPUT_PIPE`).
    pub output_pipe: String,
    /// Control API TCP port (`HTTP_PORT`).
    pub http_port: u16,
    /// Scene-change notification target, if configured (`CONTROLLER_URL`).
    pub controller_url: Option<url::Url>,
    /// Max packets retained per source buffer (`BUFFER_PACKETS`).
    pub buffer_packets: usize,
    /// PAT/PMT reinjection interval (`PSI_REPEAT_MS`).
    pub psi_repeat_interval: Duration,
}

impl RelayConfig {
    /// Loads configuration from the process environment, applying the
    /// documented defaults for anything unset, and validating the
    /// values (non-empty pipe paths, a parseable controller URL).
    pub fn from_env() -> Result<Self> {
        let camera_pipe = env_or("CAMERA_PIPE", DEFAULT_CAMERA_PIPE);
        let drone_pipe = env_or("DRONE_PIPE", DEFAULT_DRONE_PIPE);
        let fallback_pipe = env_or("FALLBACK_PIPE", DEFAULT_FALLBACK_PIPE);
        let output_pipe = env_or("OUTPUT_PIPE", DEFAULT_OUTPUT_PIPE);

        for (name, value) in [
            ("CAMERA_PIPE", &camera_pipe),
            ("DRONE_PIPE", &drone_pipe),
            ("FALLBACK_PIPE", &fallback_pipe),
            ("OUTPUT_PIPE", &output_pipe),
        ] {
            if value.trim().is_empty() {
                return Err(RelayError::Config(format!("{name} must not be empty")));
            }
        }

        let http_port = match std::env::var("HTTP_PORT") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| RelayError::Config(format!("invalid HTTP_PORT {v:?}: {e}")))?,
            Err(_) => DEFAULT_HTTP_PORT,
        };

        let controller_url = match std::env::var("CONTROLLER_URL") {
            Ok(v) if !v.trim().is_empty() => Some(
                url::Url::parse(&v)
                    .map_err(|e| RelayError::Config(format!("invalid CONTROLLER_URL {v:?}: {e}")))?,
            ),
            _ => None,
        };

        let buffer_packets = match std::env::var("BUFFER_PACKETS") {
            Ok(v) => v
                .parse::<usize>()
                .map_err(|e| RelayError::Config(format!("invalid BUFFER_PACKETS {v:?}: {e}")))?,
            Err(_) => DEFAULT_BUFFER_PACKETS,
        };

        let psi_repeat_ms = match std::env::var("PSI_REPEAT_MS") {
            Ok(v) => v
                .parse::<u64>()
                .map_err(|e| RelayError::Config(format!("invalid PSI_REPEAT_MS {v:?}: {e}")))?,
            Err(_) => DEFAULT_PSI_REPEAT_MS,
        };

        Ok(Self {
            camera_pipe,
            drone_pipe,
            fallback_pipe,
            output_pipe,
            http_port,
            controller_url,
            buffer_packets,
            psi_repeat_interval: Duration::from_millis(psi_repeat_ms),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        for key in [
            "CAMERA_PIPE",
            "DRONE_PIPE",
            "FALLBACK_PIPE",
            "OUTPUT_PIPE",
            "HTTP_PORT",
            "CONTROLLER_URL",
            "BUFFER_PACKETS",
            "PSI_REPEAT_MS",
        ] {
            std::env::remove_var(key);
        }
        let cfg = RelayConfig::from_env().unwrap();
        assert_eq!(cfg.camera_pipe, DEFAULT_CAMERA_PIPE);
        assert_eq!(cfg.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(cfg.buffer_packets, DEFAULT_BUFFER_PACKETS);
        assert!(cfg.controller_url.is_none());
    }

    #[test]
    fn rejects_invalid_port() {
        std::env::set_var("HTTP_PORT", "not-a-port");
        let result = RelayConfig::from_env();
        std::env::remove_var("HTTP_PORT");
        assert!(result.is_err());
    }
}
