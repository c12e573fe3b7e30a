//! CameraRegistry (spec §4.1, §6.1): create/start/stop/reload/remove,
//! enumerate/show/hide, the single entry point every other surface
//! (HTTP API, CLI) goes through.
//!
//! Grounded on `manager.rs::RecordingManager`'s `workers: HashMap<String,
//! WorkerEntry>` plus its `add_camera`/`remove_camera` hot-reload path,
//! generalized from "spawn once at startup, optionally hot-add" to the
//! full runtime state machine the spec names (explicit stop/start/reload,
//! not just add/remove) and wired to a shared `Watchdog` sweep instead of
//! the teacher's single global writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{CameraMode, CameraSpec, ProfileDefaults, RegistryOverride, ResolvedCameraSpec, RuntimeConfig};
use crate::error::{CoreError, Result};
use crate::pipeline::{CameraPipeline, PipelineHandles};
use crate::preview::PreviewPublisher;
use crate::reconnect::Phase;
use crate::status_store::StatusStore;
use crate::watchdog::{WatchedCamera, Watchdog};

struct RunningCamera {
    spec: CameraSpec,
    registry_override: RegistryOverride,
    resolved: ResolvedCameraSpec,
    handles: PipelineHandles,
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

enum CameraSlot {
    Running(RunningCamera),
    Stopped {
        spec: CameraSpec,
        registry_override: RegistryOverride,
        /// Kept alive across `stop()` so a subscriber can still attach and
        /// receive heartbeat JPEGs (spec §4.1, §7) even though no
        /// `CaptureSource` is feeding the bus.
        preview: Arc<PreviewPublisher>,
    },
}

/// Summary returned by `enumerate` (spec §6.1 `list_cameras`).
#[derive(Debug, Clone)]
pub struct CameraSummary {
    pub id: String,
    pub mode: CameraMode,
    pub running: bool,
    pub hidden: bool,
    pub phase: Option<Phase>,
}

pub struct CameraRegistry {
    profiles: HashMap<String, ProfileDefaults>,
    runtime: RuntimeConfig,
    status_store: Arc<dyn StatusStore>,
    cameras: RwLock<HashMap<String, CameraSlot>>,
    watched_cameras: Arc<RwLock<Vec<Arc<WatchedCamera>>>>,
    stall_senders: Arc<SyncRwLock<HashMap<String, mpsc::Sender<()>>>>,
    watchdog_stop: watch::Sender<bool>,
    watchdog_join: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CameraRegistry {
    pub fn new(profiles: HashMap<String, ProfileDefaults>, runtime: RuntimeConfig, status_store: Arc<dyn StatusStore>) -> Arc<Self> {
        let watched_cameras: Arc<RwLock<Vec<Arc<WatchedCamera>>>> = Arc::new(RwLock::new(Vec::new()));
        let stall_senders: Arc<SyncRwLock<HashMap<String, mpsc::Sender<()>>>> = Arc::new(SyncRwLock::new(HashMap::new()));
        let (watchdog_stop, wd_stop_rx) = watch::channel(false);

        let watchdog = Watchdog::new(
            Duration::from_millis(500),
            Duration::from_millis(runtime.no_frame_timeout_ms),
        );
        let watched_for_task = watched_cameras.clone();
        let stall_senders_for_task = stall_senders.clone();
        let watchdog_join = tokio::spawn(async move {
            watchdog
                .run(watched_for_task, wd_stop_rx, move |camera_id| {
                    if let Some(tx) = stall_senders_for_task.read().get(camera_id) {
                        let _ = tx.try_send(());
                    }
                })
                .await;
        });

        Arc::new(Self {
            profiles,
            runtime,
            status_store,
            cameras: RwLock::new(HashMap::new()),
            watched_cameras,
            stall_senders,
            watchdog_stop,
            watchdog_join: tokio::sync::Mutex::new(Some(watchdog_join)),
        })
    }

    /// Create and start a new camera (spec §6.1 `create_camera`).
    pub async fn create(&self, spec: CameraSpec, registry_override: RegistryOverride) -> Result<()> {
        spec.validate()?;
        let mut cameras = self.cameras.write().await;
        if cameras.contains_key(&spec.id) {
            return Err(CoreError::AlreadyExists { id: spec.id.clone() });
        }
        let running = self.spawn_running(spec.clone(), registry_override).await;
        cameras.insert(spec.id.clone(), CameraSlot::Running(running));
        Ok(())
    }

    /// Start a previously `stop`ped camera.
    pub async fn start(&self, id: &str) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        let slot = cameras.remove(id).ok_or_else(|| CoreError::NotFound { id: id.into() })?;
        let (spec, registry_override) = match slot {
            CameraSlot::Running(running) => {
                cameras.insert(id.to_string(), CameraSlot::Running(running));
                return Ok(()); // idempotent
            }
            CameraSlot::Stopped { spec, registry_override, .. } => (spec, registry_override),
        };
        let running = self.spawn_running(spec, registry_override).await;
        cameras.insert(id.to_string(), CameraSlot::Running(running));
        Ok(())
    }

    /// Stop a running camera without forgetting its configuration
    /// (spec §6.1 `stop_camera`). Only the `CaptureSource` half of the
    /// pipeline is torn down; the `PreviewPublisher`/`FrameBus` pair is kept
    /// alive so `preview()` keeps working against a stopped camera.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        let slot = cameras.remove(id).ok_or_else(|| CoreError::NotFound { id: id.into() })?;
        let running = match slot {
            CameraSlot::Running(r) => r,
            CameraSlot::Stopped { spec, registry_override, preview } => {
                cameras.insert(id.to_string(), CameraSlot::Stopped { spec, registry_override, preview });
                return Ok(()); // idempotent
            }
        };
        let spec = running.spec.clone();
        let registry_override = running.registry_override.clone();
        let preview = running.handles.preview.clone();
        self.teardown(running).await;
        cameras.insert(id.to_string(), CameraSlot::Stopped { spec, registry_override, preview });
        Ok(())
    }

    /// Replace a camera's spec in place, restarting its pipeline (spec
    /// §6.1 `reload_camera`).
    pub async fn reload(&self, spec: CameraSpec, registry_override: RegistryOverride) -> Result<()> {
        spec.validate()?;
        let mut cameras = self.cameras.write().await;
        let existing = cameras.remove(&spec.id).ok_or_else(|| CoreError::NotFound { id: spec.id.clone() })?;
        if let CameraSlot::Running(running) = existing {
            self.teardown(running).await;
        }
        let running = self.spawn_running(spec.clone(), registry_override).await;
        cameras.insert(spec.id.clone(), CameraSlot::Running(running));
        Ok(())
    }

    /// Remove a camera entirely (spec §6.1 `remove_camera`).
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut cameras = self.cameras.write().await;
        let slot = cameras.remove(id).ok_or_else(|| CoreError::NotFound { id: id.into() })?;
        if let CameraSlot::Running(running) = slot {
            self.teardown(running).await;
        }
        Ok(())
    }

    /// Hide a camera's preview (spec §6.1 `hide_camera`); the pipeline and
    /// bus keep running, only the MJPEG surface is disabled.
    pub async fn hide(&self, id: &str) -> Result<()> {
        let cameras = self.cameras.read().await;
        match cameras.get(id) {
            Some(CameraSlot::Running(running)) => {
                running.handles.preview.hide();
                Ok(())
            }
            Some(CameraSlot::Stopped { preview, .. }) => {
                preview.hide();
                Ok(())
            }
            None => Err(CoreError::NotFound { id: id.into() }),
        }
    }

    pub async fn show(&self, id: &str) -> Result<()> {
        let cameras = self.cameras.read().await;
        match cameras.get(id) {
            Some(CameraSlot::Running(running)) => {
                running.handles.preview.show();
                Ok(())
            }
            Some(CameraSlot::Stopped { preview, .. }) => {
                preview.show();
                Ok(())
            }
            None => Err(CoreError::NotFound { id: id.into() }),
        }
    }

    /// Preview publisher handle for the MJPEG HTTP surface. Available both
    /// while the camera is running and after it has been `stop()`ped — a
    /// stopped camera's publisher has no source, so subscribers fall back
    /// to heartbeat JPEGs (spec §7) instead of getting `NotFound`.
    pub async fn preview(&self, id: &str) -> Result<Arc<PreviewPublisher>> {
        let cameras = self.cameras.read().await;
        match cameras.get(id) {
            Some(CameraSlot::Running(running)) => Ok(running.handles.preview.clone()),
            Some(CameraSlot::Stopped { preview, .. }) => Ok(preview.clone()),
            None => Err(CoreError::NotFound { id: id.into() }),
        }
    }

    pub async fn enumerate(&self) -> Vec<CameraSummary> {
        let cameras = self.cameras.read().await;
        let mut out = Vec::with_capacity(cameras.len());
        for (id, slot) in cameras.iter() {
            match slot {
                CameraSlot::Running(running) => {
                    let phase = self.status_store.get_status(id).map(|s| s.phase);
                    out.push(CameraSummary {
                        id: id.clone(),
                        mode: running.spec.mode,
                        running: true,
                        hidden: running.handles.preview.is_hidden(),
                        phase,
                    });
                }
                CameraSlot::Stopped { spec, preview, .. } => out.push(CameraSummary {
                    id: id.clone(),
                    mode: spec.mode,
                    running: false,
                    hidden: preview.is_hidden(),
                    phase: None,
                }),
            }
        }
        out
    }

    async fn spawn_running(&self, spec: CameraSpec, registry_override: RegistryOverride) -> RunningCamera {
        let profile = spec.profile_name.as_deref().and_then(|name| self.profiles.get(name));
        let resolved = spec.resolve(Some(&registry_override), profile, true);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (stall_tx, stall_rx) = mpsc::channel(4);
        let (pipeline, handles) = CameraPipeline::new(
            resolved.clone(),
            self.runtime.clone(),
            self.status_store.clone(),
            stall_rx,
            stop_rx,
        );

        self.stall_senders.write().insert(spec.id.clone(), stall_tx);
        self.watched_cameras.write().await.push(handles.watched.clone());

        let join = tokio::spawn(pipeline.run());
        info!(camera = %spec.id, "camera pipeline started");

        RunningCamera {
            spec,
            registry_override,
            resolved,
            handles,
            stop_tx,
            join,
        }
    }

    async fn teardown(&self, running: RunningCamera) {
        let id = running.spec.id.clone();
        let _ = running.stop_tx.send(true);
        let _ = running.join.await;
        self.stall_senders.write().remove(&id);
        self.watched_cameras.write().await.retain(|w| w.camera_id != id);
        info!(camera = %id, "camera pipeline stopped");
    }

    /// Shut down the shared watchdog sweep. Called once at process exit.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.cameras.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.remove(&id).await;
        }
        let _ = self.watchdog_stop.send(true);
        if let Some(join) = self.watchdog_join.lock().await.take() {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, Resolution, TransportPreference};
    use std::time::Duration as StdDuration;

    fn local_spec(id: &str) -> CameraSpec {
        CameraSpec {
            id: id.into(),
            mode: CameraMode::Local,
            uri: "device:0".into(),
            transport_preference: Some(TransportPreference::Auto),
            resolution: Some(Resolution::Original),
            ready_frames: Some(1),
            ready_duration_ms: Some(0),
            ready_timeout_ms: Some(500),
            backend_priority: Some(vec![Backend::Local]),
            extra_decoder_flags: Some(String::new()),
            profile_name: None,
        }
    }

    fn registry() -> Arc<CameraRegistry> {
        CameraRegistry::new(
            HashMap::new(),
            RuntimeConfig::default(),
            Arc::new(crate::status_store::InMemoryStatusStore::new(StdDuration::from_secs(10))),
        )
    }

    #[tokio::test]
    async fn create_then_enumerate_then_remove() {
        let registry = registry();
        registry.create(local_spec("cam1"), RegistryOverride::default()).await.unwrap();

        let summaries = registry.enumerate().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, "cam1");
        assert!(summaries[0].running);

        registry.remove("cam1").await.unwrap();
        assert!(registry.enumerate().await.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let registry = registry();
        registry.create(local_spec("cam1"), RegistryOverride::default()).await.unwrap();
        let err = registry.create(local_spec("cam1"), RegistryOverride::default()).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::AlreadyExists);
        registry.remove("cam1").await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn hide_and_show_round_trip() {
        let registry = registry();
        registry.create(local_spec("cam1"), RegistryOverride::default()).await.unwrap();

        registry.hide("cam1").await.unwrap();
        assert!(registry.preview("cam1").await.unwrap().is_hidden());

        registry.show("cam1").await.unwrap();
        assert!(!registry.preview("cam1").await.unwrap().is_hidden());

        registry.remove("cam1").await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn stop_then_start_preserves_spec() {
        let registry = registry();
        registry.create(local_spec("cam1"), RegistryOverride::default()).await.unwrap();

        registry.stop("cam1").await.unwrap();
        assert!(!registry.enumerate().await[0].running);

        registry.start("cam1").await.unwrap();
        assert!(registry.enumerate().await[0].running);

        registry.remove("cam1").await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn preview_survives_stop() {
        let registry = registry();
        registry.create(local_spec("cam1"), RegistryOverride::default()).await.unwrap();

        let before = registry.preview("cam1").await.unwrap();
        registry.stop("cam1").await.unwrap();

        let after = registry.preview("cam1").await.unwrap();
        assert!(Arc::ptr_eq(&before, &after), "stop() must keep the same PreviewPublisher alive");

        registry.remove("cam1").await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn operating_on_unknown_camera_fails() {
        let registry = registry();
        assert!(registry.stop("ghost").await.is_err());
        assert!(registry.hide("ghost").await.is_err());
        registry.shutdown().await;
    }
}
