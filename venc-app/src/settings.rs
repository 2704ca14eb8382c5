//! Encoder settings persistence via TOML.
//!
//! Settings are stored at `<config_dir>/venc/settings.toml`.
//! Missing or corrupted config files return sensible defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use venc_protocol::codec::ContentMode;
use venc_protocol::{CodecType, SimulcastStream, VideoCodecSettings};

/// User-configurable encode settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Codec to encode with.
    pub codec: CodecType,
    /// Resolution and bitrate preset.
    pub quality: Quality,
    /// Camera video or screen content.
    pub content_mode: ContentMode,
    /// Target frame rate.
    pub framerate: u32,
    /// Largest single partition handed to the packetizer (0 = no limit).
    pub max_payload_size: usize,
    /// Cores the encoder may use.
    pub number_of_cores: usize,
    /// Emit key frames at the codec's key frame interval.
    pub periodic_key_frames: bool,
    /// Encode three simulcast streams instead of one.
    pub simulcast: bool,
}

/// Quality level preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

/// Resolution and bitrate bounds for a quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityProfile {
    pub width: u32,
    pub height: u32,
    pub min_bitrate_kbps: u32,
    pub start_bitrate_kbps: u32,
    pub max_bitrate_kbps: u32,
}

impl Quality {
    pub fn profile(self) -> QualityProfile {
        match self {
            Quality::Low => QualityProfile {
                width: 320,
                height: 180,
                min_bitrate_kbps: 30,
                start_bitrate_kbps: 150,
                max_bitrate_kbps: 300,
            },
            Quality::Medium => QualityProfile {
                width: 640,
                height: 360,
                min_bitrate_kbps: 50,
                start_bitrate_kbps: 500,
                max_bitrate_kbps: 1_000,
            },
            Quality::High => QualityProfile {
                width: 1280,
                height: 720,
                min_bitrate_kbps: 150,
                start_bitrate_kbps: 1_200,
                max_bitrate_kbps: 2_500,
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            codec: CodecType::Vp8,
            quality: Quality::Medium,
            content_mode: ContentMode::RealtimeVideo,
            framerate: 30,
            max_payload_size: 1200,
            number_of_cores: 1,
            periodic_key_frames: false,
            simulcast: false,
        }
    }
}

impl Settings {
    /// Load settings from the default config path.
    ///
    /// Returns defaults if the file doesn't exist or is corrupted.
    pub fn load() -> Self {
        Self::load_from_dir(Self::config_dir())
    }

    /// Save settings to the default config path.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(Self::config_dir())
    }

    /// Load settings from a specific config directory.
    pub fn load_from_dir(config_dir: PathBuf) -> Self {
        let path = config_dir.join("settings.toml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(settings) => {
                    tracing::info!(path = %path.display(), "settings loaded");
                    settings
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "corrupted settings file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(
                    path = %path.display(),
                    "settings file not found, using defaults"
                );
                Self::default()
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to read settings file, using defaults"
                );
                Self::default()
            }
        }
    }

    /// Save settings to a specific config directory.
    pub fn save_to_dir(&self, config_dir: PathBuf) -> Result<()> {
        std::fs::create_dir_all(&config_dir).with_context(|| {
            format!(
                "failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let path = config_dir.join("settings.toml");
        let contents = toml::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(&path, &contents)
            .with_context(|| format!("failed to write settings file: {}", path.display()))?;

        tracing::info!(path = %path.display(), "settings saved");
        Ok(())
    }

    /// Build the encoder configuration these settings describe.
    ///
    /// With simulcast on, the preset resolution becomes the top stream and
    /// two lower streams at half and quarter size are added below it.
    pub fn codec_settings(&self) -> VideoCodecSettings {
        let profile = self.quality.profile();
        let mut settings = VideoCodecSettings::new(
            self.codec,
            profile.width,
            profile.height,
            profile.start_bitrate_kbps,
        );
        settings.min_bitrate_kbps = profile.min_bitrate_kbps;
        settings.max_bitrate_kbps = profile.max_bitrate_kbps;
        settings.max_framerate = self.framerate;
        settings.mode = self.content_mode;

        if self.simulcast {
            settings.simulcast_streams = [4, 2, 1]
                .into_iter()
                .map(|divisor| SimulcastStream {
                    width: profile.width / divisor,
                    height: profile.height / divisor,
                    number_of_temporal_layers: 1,
                    min_bitrate_kbps: profile.min_bitrate_kbps / divisor,
                    target_bitrate_kbps: profile.start_bitrate_kbps / divisor,
                    max_bitrate_kbps: profile.max_bitrate_kbps / divisor,
                    qp_max: settings.qp_max,
                })
                .collect();
            // Room for every stream at its max
            settings.max_bitrate_kbps = settings
                .simulcast_streams
                .iter()
                .map(|s| s.max_bitrate_kbps)
                .sum();
        }

        settings
    }

    /// Get the default config directory.
    fn config_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "venc")
            .map(|d| d.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("venc-config"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "debug".into()),
            )
            .with_test_writer()
            .try_init();
    }

    #[test]
    fn default_settings_are_valid() {
        init_test_tracing();
        let settings = Settings::default();
        assert_eq!(settings.quality, Quality::Medium);
        assert_eq!(settings.codec, CodecType::Vp8);
        assert_eq!(settings.codec_settings().validate(), Ok(()));
    }

    #[test]
    fn save_and_load_roundtrip() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let config_dir = tmp.path().to_path_buf();

        let settings = Settings {
            codec: CodecType::H264,
            quality: Quality::High,
            content_mode: ContentMode::Screensharing,
            framerate: 15,
            max_payload_size: 1000,
            number_of_cores: 4,
            periodic_key_frames: true,
            simulcast: true,
        };

        settings.save_to_dir(config_dir.clone()).unwrap();
        let loaded = Settings::load_from_dir(config_dir);

        assert_eq!(settings, loaded);
    }

    #[test]
    fn missing_config_returns_defaults() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let loaded = Settings::load_from_dir(tmp.path().join("nonexistent"));
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn corrupted_config_returns_defaults() {
        init_test_tracing();
        let tmp = TempDir::new().unwrap();
        let config_dir = tmp.path().to_path_buf();

        std::fs::write(config_dir.join("settings.toml"), "{{{{not valid toml}}}}").unwrap();

        let loaded = Settings::load_from_dir(config_dir);
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn enums_serialize_lowercase() {
        let settings = Settings {
            codec: CodecType::H264,
            quality: Quality::Low,
            ..Settings::default()
        };
        let toml_str = toml::to_string_pretty(&settings).unwrap();
        assert!(toml_str.contains("codec = \"h264\""));
        assert!(toml_str.contains("quality = \"low\""));
        assert!(toml_str.contains("content_mode = \"realtimevideo\""));
    }

    #[test]
    fn presets_map_to_codec_settings() {
        let settings = Settings {
            quality: Quality::High,
            framerate: 25,
            ..Settings::default()
        };
        let codec = settings.codec_settings();
        assert_eq!((codec.width, codec.height), (1280, 720));
        assert_eq!(codec.start_bitrate_kbps, 1_200);
        assert_eq!(codec.max_bitrate_kbps, 2_500);
        assert_eq!(codec.max_framerate, 25);
        assert!(codec.simulcast_streams.is_empty());
    }

    #[test]
    fn simulcast_streams_ascend_to_preset() {
        let settings = Settings {
            quality: Quality::High,
            simulcast: true,
            ..Settings::default()
        };
        let codec = settings.codec_settings();
        let sizes: Vec<(u32, u32)> = codec
            .simulcast_streams
            .iter()
            .map(|s| (s.width, s.height))
            .collect();
        assert_eq!(sizes, vec![(320, 180), (640, 360), (1280, 720)]);
        assert_eq!(codec.max_bitrate_kbps, 625 + 1_250 + 2_500);
        assert_eq!(codec.validate(), Ok(()));
    }
}
