//! Configuration: top-level `Config` loaded from TOML, per-camera
//! `CameraSpec` (spec §3), named profiles, and the precedence resolution
//! that produces an immutable `ResolvedCameraSpec`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, ErrorCode, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// List of cameras to capture.
    pub cameras: Vec<CameraSpec>,
    /// Named override sets, selected per-camera via `profile_name`.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileDefaults>,
    /// HTTP API / preview server configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Watchdog and bus tuning shared by all cameras.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            port: default_api_port(),
        }
    }
}

fn default_api_enabled() -> bool {
    true
}
fn default_api_port() -> u16 {
    8080
}

/// Process-wide timeouts recognized per spec §5/§6.4. Any of these can
/// also be overridden by the matching environment variable at startup
/// (see `RuntimeConfig::apply_env_overrides`).
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_no_frame_timeout_ms")]
    pub no_frame_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_target_fps")]
    pub target_fps: f64,
    #[serde(default = "default_jpeg_quality")]
    pub frame_jpeg_quality: u8,
    #[serde(default = "default_rtsp_stimeout_usec")]
    pub rtsp_stimeout_usec: u64,
    #[serde(default = "default_ffprobe_timeout_sec")]
    pub ffprobe_timeout_sec: u64,
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,
    #[serde(default = "default_ffmpeg_reconnect_delay")]
    pub ffmpeg_reconnect_delay_secs: u64,
    #[serde(default = "default_stream_probe_fallback_ttl")]
    pub stream_probe_fallback_ttl_secs: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_open_ms")]
    pub breaker_open_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Force `tcp` transport regardless of per-camera preference
    /// (`RTSP_TCP` env switch).
    #[serde(default)]
    pub force_tcp: bool,
    /// Extra flags prepended to every decoder invocation
    /// (`FFMPEG_EXTRA_FLAGS` env switch).
    #[serde(default)]
    pub ffmpeg_extra_flags: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            no_frame_timeout_ms: default_no_frame_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            target_fps: default_target_fps(),
            frame_jpeg_quality: default_jpeg_quality(),
            rtsp_stimeout_usec: default_rtsp_stimeout_usec(),
            ffprobe_timeout_sec: default_ffprobe_timeout_sec(),
            queue_max: default_queue_max(),
            ffmpeg_reconnect_delay_secs: default_ffmpeg_reconnect_delay(),
            stream_probe_fallback_ttl_secs: default_stream_probe_fallback_ttl(),
            breaker_threshold: default_breaker_threshold(),
            breaker_open_ms: default_breaker_open_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            force_tcp: false,
            ffmpeg_extra_flags: String::new(),
        }
    }
}

fn default_no_frame_timeout_ms() -> u64 {
    2000
}
fn default_heartbeat_interval_ms() -> u64 {
    1500
}
fn default_target_fps() -> f64 {
    15.0
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_rtsp_stimeout_usec() -> u64 {
    5_000_000
}
fn default_ffprobe_timeout_sec() -> u64 {
    30
}
fn default_queue_max() -> usize {
    2
}
fn default_ffmpeg_reconnect_delay() -> u64 {
    2
}
fn default_stream_probe_fallback_ttl() -> u64 {
    120
}
fn default_breaker_threshold() -> u32 {
    3
}
fn default_breaker_open_ms() -> u64 {
    15_000
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    10_000
}

impl RuntimeConfig {
    /// Apply the environment switches from spec §6.4 on top of whatever
    /// the TOML file set. Env wins, matching the teacher's convention of
    /// treating env vars as an operator override layer above config files.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RTSP_TCP") {
            self.force_tcp = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Ok(v) = std::env::var("FFMPEG_EXTRA_FLAGS") {
            self.ffmpeg_extra_flags = v;
        }
        set_from_env(&mut self.queue_max, "QUEUE_MAX");
        set_from_env(&mut self.target_fps, "TARGET_FPS");
        set_from_env(&mut self.frame_jpeg_quality, "FRAME_JPEG_QUALITY");
        set_from_env(&mut self.no_frame_timeout_ms, "NO_FRAME_TIMEOUT_MS");
        set_from_env(&mut self.heartbeat_interval_ms, "HEARTBEAT_INTERVAL_MS");
        set_from_env(&mut self.rtsp_stimeout_usec, "RTSP_STIMEOUT_USEC");
        set_from_env(&mut self.ffprobe_timeout_sec, "FFPROBE_TIMEOUT_SEC");
    }
}

fn set_from_env<T: std::str::FromStr>(slot: &mut T, var: &str) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(parsed) = v.parse() {
            *slot = parsed;
        }
    }
}

/// Camera transport mode.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    Rtsp,
    Http,
    Local,
}

/// RTSP transport preference.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    Tcp,
    Udp,
    Auto,
}

impl Default for TransportPreference {
    fn default() -> Self {
        TransportPreference::Auto
    }
}

/// Decoder backend kind, ordered in `backend_priority`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Ffmpeg,
    Gstreamer,
    Local,
}

/// Target resolution: either pass the source through unchanged, or
/// request a specific `WxH` (each dimension in `[16, 7680]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Original,
    Fixed { width: u32, height: u32 },
}

impl Resolution {
    pub fn parse(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("original") {
            return Ok(Resolution::Original);
        }
        let (w, h) = s
            .split_once('x')
            .or_else(|| s.split_once('X'))
            .ok_or_else(|| {
                CoreError::classified(
                    ErrorCode::InvalidSpec,
                    format!("resolution '{s}' is not 'original' or 'WxH'"),
                )
            })?;
        let width: u32 = w
            .parse()
            .map_err(|_| CoreError::classified(ErrorCode::InvalidSpec, format!("bad width in '{s}'")))?;
        let height: u32 = h
            .parse()
            .map_err(|_| CoreError::classified(ErrorCode::InvalidSpec, format!("bad height in '{s}'")))?;
        if !(16..=7680).contains(&width) || !(16..=7680).contains(&height) {
            return Err(CoreError::classified(
                ErrorCode::InvalidSpec,
                format!("resolution '{s}' out of bounds [16,7680]"),
            ));
        }
        Ok(Resolution::Fixed { width, height })
    }

    pub fn as_ffmpeg_scale(&self) -> Option<String> {
        match self {
            Resolution::Original => None,
            Resolution::Fixed { width, height } => Some(format!("{width}x{height}")),
        }
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Resolution::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Resolution {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            Resolution::Original => "original".to_string(),
            Resolution::Fixed { width, height } => format!("{width}x{height}"),
        };
        serializer.serialize_str(&s)
    }
}

/// Per-camera configuration (spec §3 `CameraSpec`), immutable after
/// creation; `CameraRegistry::reload` replaces it atomically.
///
/// Every overridable field is `Option` so resolution (spec §3
/// `profile_name`: "explicit → registry override → profile default") can
/// tell "the operator left this unset" apart from "the operator explicitly
/// chose the same value the built-in default would have picked". A plain,
/// always-populated field couldn't make that distinction, which would let a
/// profile default silently win over an explicit choice.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraSpec {
    pub id: String,
    pub mode: CameraMode,
    pub uri: String,
    #[serde(default)]
    pub transport_preference: Option<TransportPreference>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub ready_frames: Option<u32>,
    #[serde(default)]
    pub ready_duration_ms: Option<u64>,
    #[serde(default)]
    pub ready_timeout_ms: Option<u64>,
    #[serde(default)]
    pub backend_priority: Option<Vec<Backend>>,
    #[serde(default)]
    pub extra_decoder_flags: Option<String>,
    #[serde(default)]
    pub profile_name: Option<String>,
}

/// Built-in defaults, consulted only once no explicit/override/profile
/// value was found anywhere in the resolution chain.
fn default_transport_preference() -> TransportPreference {
    TransportPreference::Auto
}
fn default_resolution() -> Resolution {
    Resolution::Original
}
fn default_ready_frames() -> u32 {
    1
}
fn default_ready_timeout_ms() -> u64 {
    15_000
}
fn default_backend_priority() -> Vec<Backend> {
    vec![Backend::Ffmpeg, Backend::Gstreamer]
}

/// A named override set a `CameraSpec` may opt into via `profile_name`.
/// Every field is optional; only set fields override the camera's own
/// default in the resolution order explicit > registry override > profile.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProfileDefaults {
    pub transport_preference: Option<TransportPreference>,
    pub resolution: Option<Resolution>,
    pub ready_frames: Option<u32>,
    pub ready_duration_ms: Option<u64>,
    pub ready_timeout_ms: Option<u64>,
    pub backend_priority: Option<Vec<Backend>>,
    pub extra_decoder_flags: Option<String>,
}

/// Per-camera registry-level overrides, set at runtime (e.g. by an
/// external settings layer) and consulted during resolution before the
/// profile default, but after the explicit spec field.
#[derive(Debug, Clone, Default)]
pub struct RegistryOverride {
    pub transport_preference: Option<TransportPreference>,
    pub resolution: Option<Resolution>,
    pub extra_decoder_flags: Option<String>,
}

/// The immutable, fully-resolved spec a pipeline actually runs with.
/// Computed once at `create`/`reload`; nothing downstream re-resolves.
#[derive(Debug, Clone)]
pub struct ResolvedCameraSpec {
    pub id: String,
    pub mode: CameraMode,
    pub uri: String,
    pub transport_preference: TransportPreference,
    pub resolution: Resolution,
    pub ready_frames: u32,
    pub ready_duration_ms: u64,
    pub ready_timeout_ms: u64,
    pub backend_priority: Vec<Backend>,
    pub extra_decoder_flags: String,
}

impl CameraSpec {
    /// Validate field shapes that Serde's type system alone can't enforce
    /// (non-empty id, non-empty uri, mode/uri coherence).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::classified(ErrorCode::InvalidSpec, "id must not be empty"));
        }
        if self.uri.trim().is_empty() {
            return Err(CoreError::classified(ErrorCode::InvalidSpec, "uri must not be empty"));
        }
        if self.mode == CameraMode::Rtsp && !self.uri.starts_with("rtsp://") {
            return Err(CoreError::classified(
                ErrorCode::InvalidSpec,
                format!("camera '{}': mode=rtsp requires an rtsp:// uri", self.id),
            ));
        }
        if self.mode == CameraMode::Http && !(self.uri.starts_with("http://") || self.uri.starts_with("https://")) {
            return Err(CoreError::classified(
                ErrorCode::InvalidSpec,
                format!("camera '{}': mode=http requires an http(s):// uri", self.id),
            ));
        }
        Ok(())
    }

    /// Resolve precedence (spec §3): explicit spec field > registry
    /// override > named profile default > built-in default. `self`'s
    /// fields are `Option`, so "the operator set this" and "nothing was
    /// set anywhere in the chain" are distinguishable; downstream
    /// components only ever see the result of this, never re-derive it.
    pub fn resolve(
        &self,
        registry_override: Option<&RegistryOverride>,
        profile: Option<&ProfileDefaults>,
        for_display: bool,
    ) -> ResolvedCameraSpec {
        let transport_preference = self
            .transport_preference
            .or_else(|| registry_override.and_then(|o| o.transport_preference))
            .or_else(|| profile.and_then(|p| p.transport_preference))
            .unwrap_or_else(default_transport_preference);

        let resolution = self
            .resolution
            .or_else(|| registry_override.and_then(|o| o.resolution))
            .or_else(|| profile.and_then(|p| p.resolution))
            .unwrap_or_else(default_resolution);

        let extra_decoder_flags = self
            .extra_decoder_flags
            .clone()
            .or_else(|| registry_override.and_then(|o| o.extra_decoder_flags.clone()))
            .or_else(|| profile.and_then(|p| p.extra_decoder_flags.clone()))
            .unwrap_or_default();

        let mut backend_priority = self
            .backend_priority
            .clone()
            .or_else(|| profile.and_then(|p| p.backend_priority.clone()))
            .unwrap_or_else(default_backend_priority);

        // `local` is consulted only when the caller asked for a display path.
        if !for_display {
            backend_priority.retain(|b| *b != Backend::Local);
        }

        ResolvedCameraSpec {
            id: self.id.clone(),
            mode: self.mode,
            uri: self.uri.clone(),
            transport_preference,
            resolution,
            ready_frames: self
                .ready_frames
                .or_else(|| profile.and_then(|p| p.ready_frames))
                .unwrap_or_else(default_ready_frames),
            ready_duration_ms: self
                .ready_duration_ms
                .or_else(|| profile.and_then(|p| p.ready_duration_ms))
                .unwrap_or(0),
            ready_timeout_ms: self
                .ready_timeout_ms
                .or_else(|| profile.and_then(|p| p.ready_timeout_ms))
                .unwrap_or_else(default_ready_timeout_ms),
            backend_priority,
            extra_decoder_flags,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read config file: {e}")))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid TOML: {e}")))?;
        config.runtime.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            cam.validate()?;
            if !seen.insert(cam.id.clone()) {
                return Err(CoreError::Config(format!("duplicate camera id '{}'", cam.id)));
            }
            if let Some(name) = &cam.profile_name {
                if !self.profiles.contains_key(name) {
                    return Err(CoreError::Config(format!(
                        "camera '{}' references unknown profile '{}'",
                        cam.id, name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_parses_original_and_fixed() {
        assert_eq!(Resolution::parse("original").unwrap(), Resolution::Original);
        assert_eq!(
            Resolution::parse("1280x720").unwrap(),
            Resolution::Fixed { width: 1280, height: 720 }
        );
    }

    #[test]
    fn resolution_rejects_out_of_bounds() {
        assert!(Resolution::parse("8x8").is_err());
        assert!(Resolution::parse("99999x720").is_err());
    }

    fn bare_spec(id: &str, mode: CameraMode, uri: &str) -> CameraSpec {
        CameraSpec {
            id: id.into(),
            mode,
            uri: uri.into(),
            transport_preference: None,
            resolution: None,
            ready_frames: None,
            ready_duration_ms: None,
            ready_timeout_ms: None,
            backend_priority: None,
            extra_decoder_flags: None,
            profile_name: None,
        }
    }

    #[test]
    fn rtsp_mode_requires_rtsp_uri() {
        let spec = bare_spec("cam1", CameraMode::Rtsp, "http://example.com/s");
        assert!(spec.validate().is_err());
    }

    #[test]
    fn resolve_precedence_override_then_profile_when_unset() {
        let mut spec = bare_spec("cam1", CameraMode::Rtsp, "rtsp://example.com/s");
        spec.profile_name = Some("fast".into());

        // Nothing explicit, profile sets udp -> profile wins.
        let profile = ProfileDefaults {
            transport_preference: Some(TransportPreference::Udp),
            ..Default::default()
        };
        let resolved = spec.resolve(None, Some(&profile), false);
        assert_eq!(resolved.transport_preference, TransportPreference::Udp);

        // Registry override beats the profile.
        let over = RegistryOverride {
            transport_preference: Some(TransportPreference::Tcp),
            ..Default::default()
        };
        let resolved = spec.resolve(Some(&over), Some(&profile), false);
        assert_eq!(resolved.transport_preference, TransportPreference::Tcp);
    }

    #[test]
    fn resolve_explicit_field_beats_registry_override_and_profile() {
        let mut spec = bare_spec("cam1", CameraMode::Rtsp, "rtsp://example.com/s");
        spec.transport_preference = Some(TransportPreference::Tcp);
        spec.profile_name = Some("fast".into());

        let profile = ProfileDefaults {
            transport_preference: Some(TransportPreference::Udp),
            ..Default::default()
        };
        let over = RegistryOverride {
            transport_preference: Some(TransportPreference::Udp),
            ..Default::default()
        };

        // The camera's own explicit choice wins over both the registry
        // override and the profile default.
        let resolved = spec.resolve(Some(&over), Some(&profile), false);
        assert_eq!(resolved.transport_preference, TransportPreference::Tcp);
    }

    #[test]
    fn local_backend_dropped_unless_for_display() {
        let mut spec = bare_spec("cam1", CameraMode::Rtsp, "rtsp://example.com/s");
        spec.backend_priority = Some(vec![Backend::Ffmpeg, Backend::Local]);
        let resolved = spec.resolve(None, None, false);
        assert!(!resolved.backend_priority.contains(&Backend::Local));
        let resolved = spec.resolve(None, None, true);
        assert!(resolved.backend_priority.contains(&Backend::Local));
    }
}
