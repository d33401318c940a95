//! Tests for the filesystem adapters: image store and settings file.

use assert_matches::assert_matches;
use canvasgen_client::service::TransportMode;
use canvasgen_core::job::{Job, JobKind};
use canvasgen_queue::collaborators::{CanvasSink, ImageStore};
use canvasgen_worker::settings::{Settings, SettingsError};
use canvasgen_worker::storage::{FsImageStore, LogCanvas};

// ---------------------------------------------------------------------------
// Test: FsImageStore writes bytes under the output directory
// ---------------------------------------------------------------------------

#[tokio::test]
async fn image_store_writes_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsImageStore::new(dir.path().join("nested/outputs"));
    let job_id = canvasgen_core::types::JobId::new_v4();

    let first = store.store(job_id, 0, b"png-bytes").await.unwrap();
    let second = store.store(job_id, 1, b"more").await.unwrap();

    assert!(first.ends_with(&format!("{job_id}-0.png")));
    assert_eq!(std::fs::read(&first).unwrap(), b"png-bytes");
    assert_eq!(std::fs::read(&second).unwrap(), b"more");
}

#[tokio::test]
async fn log_canvas_accepts_every_image() {
    let job = Job::new(JobKind::TextToImage, Default::default());
    LogCanvas.insert(&job, "outputs/a.png").await.unwrap();
}

// ---------------------------------------------------------------------------
// Test: settings persist the transport preference
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_settings_file_yields_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::load(&dir.path().join("absent.json")).await.unwrap();
    assert_eq!(settings.progress_mode, TransportMode::Auto);
}

#[tokio::test]
async fn settings_survive_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config/settings.json");

    let settings = Settings {
        progress_mode: TransportMode::Polling,
    };
    settings.save(&path).await.unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains("\"polling\""));
    assert_eq!(Settings::load(&path).await.unwrap(), settings);
}

#[tokio::test]
async fn empty_object_uses_defaults_and_garbage_is_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("empty.json");
    std::fs::write(&path, "{}").unwrap();
    assert_eq!(Settings::load(&path).await.unwrap(), Settings::default());

    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert_matches!(Settings::load(&path).await, Err(SettingsError::Parse(_)));
}
