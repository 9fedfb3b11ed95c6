// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use crate::backend::swapchain::SwapchainPreferences;
use crate::orchestrator::FrameSettings;
use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Pacer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// How long a fence wait may block before the GPU is considered hung
    pub fence_timeout_ms: u64,
    /// Sleep between event polls while the window is minimized
    pub minimize_poll_ms: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: crate::MAX_FRAMES_IN_FLIGHT,
            fence_timeout_ms: 5000,
            minimize_poll_ms: 16,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Watch config.toml and apply clear color changes live
    pub hot_reload: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: true,
            log_file: "vulkan_debug.log".to_string(),
            show_fps: true,
            hot_reload: false,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Reject values the frame loop cannot run with
    pub fn validate(&self) -> Result<()> {
        let frames = self.graphics.max_frames_in_flight;
        if !(1..=4).contains(&frames) {
            anyhow::bail!("graphics.max_frames_in_flight must be between 1 and 4, got {}", frames);
        }
        if self.graphics.fence_timeout_ms == 0 {
            anyhow::bail!("graphics.fence_timeout_ms must be greater than zero");
        }
        if self.window.width == 0 || self.window.height == 0 {
            anyhow::bail!(
                "window size must be non-zero, got {}x{}",
                self.window.width,
                self.window.height
            );
        }
        if let Some(c) = self.graphics.clear_color.iter().find(|c| !(0.0..=1.0).contains(*c)) {
            anyhow::bail!("graphics.clear_color components must be in 0..=1, got {}", c);
        }
        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Present modes in order of preference. FIFO is the swapchain's own
    /// fallback and is not listed unless asked for.
    pub fn present_mode_preferences(&self) -> Vec<vk::PresentModeKHR> {
        match self.get_present_mode() {
            // Tearing is acceptable, so the other low-latency mode is next best
            vk::PresentModeKHR::IMMEDIATE => {
                vec![vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
            }
            vk::PresentModeKHR::FIFO_RELAXED => {
                vec![vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO]
            }
            mode => vec![mode],
        }
    }

    /// Orchestrator settings derived from the graphics section
    pub fn frame_settings(&self) -> FrameSettings {
        let fence_timeout = Duration::from_millis(self.graphics.fence_timeout_ms);
        FrameSettings {
            frames_in_flight: self.graphics.max_frames_in_flight,
            fence_timeout,
            acquire_timeout: fence_timeout,
            swapchain: SwapchainPreferences {
                present_modes: self.present_mode_preferences(),
                ..SwapchainPreferences::default()
            },
        }
    }

    pub fn minimize_poll(&self) -> Duration {
        Duration::from_millis(self.graphics.minimize_poll_ms)
    }

    pub fn clear_color(&self) -> vk::ClearColorValue {
        vk::ClearColorValue {
            float32: self.graphics.clear_color,
        }
    }
}
