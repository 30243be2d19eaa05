//! End-to-end reconciliation tests: capture offline, persist, sync against
//! a scripted remote, and verify the queue, draft, and submission effects.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use terrascore_rs::capture;
use terrascore_rs::client::SurveyApi;
use terrascore_rs::error::{TerraError, TerraResult};
use terrascore_rs::geofence::ArrivalGate;
use terrascore_rs::models::{
    GpsPoint, LocationUpdate, MediaMetadata, MediaRecord, Offer, PresignedUrlResponse, StepKind,
    StepResponse, SurveyStep, SurveySubmission, SurveyTemplate, UploadStatus, UploadTaskSeed,
};
use terrascore_rs::store::SurveyStore;
use terrascore_rs::survey::SurveySession;
use terrascore_rs::sync::{submission_from_draft, SyncOrchestrator, SyncTrigger};
use terrascore_rs::upload::{UploadPipeline, UploadStrategy};
use tokio::sync::Semaphore;

// ===== SCRIPTED REMOTE =====

#[derive(Default)]
struct RemoteState {
    location_updates: Vec<LocationUpdate>,
    registered: Vec<MediaMetadata>,
    multiparts: Vec<MediaMetadata>,
    submissions: Vec<(String, SurveySubmission)>,
    arrivals: Vec<(String, LocationUpdate)>,
    presign_calls: usize,
    put_calls: usize,
    fail_uploads: bool,
    fail_submit: bool,
    fail_location: bool,
    reject_arrival: bool,
}

struct MockApi {
    state: Mutex<RemoteState>,
    /// When set, `update_location` parks until a permit arrives.
    location_gate: Option<Arc<Semaphore>>,
    location_entered: AtomicUsize,
}

impl MockApi {
    fn new(state: RemoteState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            location_gate: None,
            location_entered: AtomicUsize::new(0),
        })
    }

    fn gated(state: RemoteState, gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            location_gate: Some(gate),
            location_entered: AtomicUsize::new(0),
        })
    }

    fn server_error() -> TerraError {
        TerraError::Api {
            status: 500,
            code: "internal".to_string(),
            message: "remote unavailable".to_string(),
        }
    }
}

#[async_trait]
impl SurveyApi for MockApi {
    async fn get_template(&self, _job_id: &str) -> TerraResult<SurveyTemplate> {
        Ok(SurveyTemplate {
            id: "tmpl-1".to_string(),
            name: "Standard parcel survey".to_string(),
            survey_type: "standard".to_string(),
            version: Some(1),
            steps: vec![],
        })
    }

    async fn presigned_upload(
        &self,
        job_id: &str,
        _content_type: &str,
        step_id: &str,
    ) -> TerraResult<PresignedUrlResponse> {
        let mut state = self.state.lock().unwrap();
        state.presign_calls += 1;
        if state.fail_uploads {
            return Err(Self::server_error());
        }
        Ok(PresignedUrlResponse {
            upload_url: "https://bucket.test/put".to_string(),
            s3_key: format!("media/{job_id}/{step_id}/fixed.jpg"),
            expires_in: 900,
        })
    }

    async fn put_bytes(
        &self,
        _upload_url: &str,
        _content_type: &str,
        _bytes: Vec<u8>,
    ) -> TerraResult<()> {
        let mut state = self.state.lock().unwrap();
        state.put_calls += 1;
        if state.fail_uploads {
            return Err(Self::server_error());
        }
        Ok(())
    }

    async fn register_media(
        &self,
        _job_id: &str,
        meta: &MediaMetadata,
    ) -> TerraResult<MediaRecord> {
        let mut state = self.state.lock().unwrap();
        if state.fail_uploads {
            return Err(Self::server_error());
        }
        state.registered.push(meta.clone());
        Ok(MediaRecord {
            id: "media-1".to_string(),
            s3_key: meta.s3_key.clone(),
            step_id: meta.step_id.clone(),
            media_type: meta.media_type.clone(),
            uploaded_at: "2026-08-06T10:00:00+00:00".to_string(),
        })
    }

    async fn upload_media_multipart(
        &self,
        job_id: &str,
        meta: &MediaMetadata,
        _file_name: &str,
        _content_type: &str,
        _bytes: Vec<u8>,
    ) -> TerraResult<MediaRecord> {
        let mut state = self.state.lock().unwrap();
        if state.fail_uploads {
            return Err(Self::server_error());
        }
        let key = format!("media/{job_id}/{}/proxy.jpg", meta.step_id);
        state.multiparts.push(meta.clone());
        Ok(MediaRecord {
            id: "media-2".to_string(),
            s3_key: key.clone(),
            step_id: meta.step_id.clone(),
            media_type: meta.media_type.clone(),
            uploaded_at: "2026-08-06T10:00:00+00:00".to_string(),
        })
    }

    async fn submit_survey(
        &self,
        job_id: &str,
        submission: &SurveySubmission,
    ) -> TerraResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_submit {
            return Err(Self::server_error());
        }
        state
            .submissions
            .push((job_id.to_string(), submission.clone()));
        Ok(())
    }

    async fn confirm_arrival(&self, job_id: &str, update: &LocationUpdate) -> TerraResult<()> {
        let reject = self.state.lock().unwrap().reject_arrival;
        if reject {
            return Err(TerraError::Api {
                status: 422,
                code: "TOO_FAR".to_string(),
                message: "agent is not at the parcel".to_string(),
            });
        }
        self.state
            .lock()
            .unwrap()
            .arrivals
            .push((job_id.to_string(), update.clone()));
        Ok(())
    }

    async fn update_location(&self, update: &LocationUpdate) -> TerraResult<()> {
        self.location_entered.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.location_gate {
            gate.acquire().await.unwrap().forget();
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_location {
            return Err(Self::server_error());
        }
        state.location_updates.push(update.clone());
        Ok(())
    }

    async fn fetch_offers(&self) -> TerraResult<Vec<Offer>> {
        Ok(vec![])
    }
}

// ===== HELPERS =====

fn photo_step(id: &str) -> SurveyStep {
    SurveyStep {
        id: id.to_string(),
        kind: StepKind::Photo,
        title: "Front of parcel".to_string(),
        description: None,
        required: true,
        options: None,
    }
}

fn checklist_step(id: &str) -> SurveyStep {
    SurveyStep {
        id: id.to_string(),
        kind: StepKind::Checklist,
        title: "Land condition".to_string(),
        description: None,
        required: true,
        options: Some(vec!["clear".to_string(), "overgrown".to_string()]),
    }
}

fn trace_step(id: &str) -> SurveyStep {
    SurveyStep {
        id: id.to_string(),
        kind: StepKind::GpsTrace,
        title: "Walk the boundary".to_string(),
        description: None,
        required: true,
        options: None,
    }
}

fn completed(step_id: &str, kind: StepKind, value: serde_json::Value) -> StepResponse {
    StepResponse {
        step_id: step_id.to_string(),
        kind,
        value,
        completed: true,
    }
}

fn write_capture_file(dir: &tempfile::TempDir, name: &str, bytes: &[u8]) -> String {
    let path = dir.path().join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(bytes).unwrap();
    path.to_string_lossy().to_string()
}

fn seed_for_file(job_id: &str, step_id: &str, file_path: &str) -> UploadTaskSeed {
    UploadTaskSeed {
        job_id: job_id.to_string(),
        step_id: step_id.to_string(),
        file_path: file_path.to_string(),
        content_type: "image/jpeg".to_string(),
        content_hash: "feedface".to_string(),
        byte_size: 8,
        lat: 12.9,
        lng: 77.5,
        captured_at: "2026-08-06T09:00:00+00:00".to_string(),
    }
}

// ===== SCENARIOS =====

#[tokio::test]
async fn test_offline_capture_then_sync_submits_draft_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = write_capture_file(&dir, "front.jpg", b"parcel evidence bytes");

    let store = Arc::new(SurveyStore::open_in_memory().unwrap());
    let api = MockApi::new(RemoteState::default());

    // Capture one photo while offline and fall back to the draft path.
    let mut session = SurveySession::new();
    session.init("job-9", "tmpl-1", vec![photo_step("s1")]);
    let media = capture::capture_media("s1", &file_path, 12.9716, 77.5946)
        .await
        .unwrap();
    let expected_hash = media.content_hash.clone();
    session.add_media(media);
    session.set_response(completed("s1", StepKind::Photo, serde_json::Value::Null));
    session.save_offline(&store).unwrap();

    let pending = store.get_pending_uploads().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, UploadStatus::Pending);
    assert_eq!(pending[0].retry_count, 0);
    let task_id = pending[0].id;

    // Connectivity restored: one sync pass reconciles everything.
    let orchestrator =
        SyncOrchestrator::new(api.clone(), store.clone(), UploadPipeline::default());
    orchestrator.run_sync().await;

    let state = api.state.lock().unwrap();
    assert_eq!(state.registered.len(), 1);
    assert_eq!(state.registered[0].sha256, expected_hash);
    assert_eq!(state.submissions.len(), 1);
    assert_eq!(state.submissions[0].0, "job-9");
    assert_eq!(state.submissions[0].1.responses["s1"], "uploaded");
    drop(state);

    // Draft deleted and the done task purged.
    assert!(store.get_survey_draft("job-9").unwrap().is_none());
    assert!(store.get_upload_task(task_id).unwrap().is_none());

    // A second pass has nothing left to do: no duplicate submission.
    orchestrator.run_sync().await;
    assert_eq!(api.state.lock().unwrap().submissions.len(), 1);
}

#[tokio::test]
async fn test_failed_uploads_retry_up_to_ceiling_then_stall() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = write_capture_file(&dir, "front.jpg", b"evidence");

    let store = Arc::new(SurveyStore::open_in_memory().unwrap());
    let api = MockApi::new(RemoteState {
        fail_uploads: true,
        ..Default::default()
    });

    let task = store
        .enqueue_upload(seed_for_file("job-2", "s1", &file_path))
        .unwrap();

    let orchestrator =
        SyncOrchestrator::new(api.clone(), store.clone(), UploadPipeline::default());

    for expected_retries in 1..=3u32 {
        orchestrator.run_sync().await;
        let current = store.get_upload_task(task.id).unwrap().unwrap();
        assert_eq!(current.status, UploadStatus::Failed);
        assert_eq!(current.retry_count, expected_retries);
    }

    // Retry ceiling reached: the task is permanently stalled, not deleted.
    assert!(store.get_pending_uploads().unwrap().is_empty());
    let attempts_so_far = api.state.lock().unwrap().presign_calls;
    assert_eq!(attempts_so_far, 3);

    orchestrator.run_sync().await;
    assert_eq!(api.state.lock().unwrap().presign_calls, attempts_so_far);
}

#[tokio::test]
async fn test_run_sync_is_single_flight() {
    let store = Arc::new(SurveyStore::open_in_memory().unwrap());
    store.buffer_location(12.9, 77.5, 5.0, 1_000).unwrap();

    let gate = Arc::new(Semaphore::new(0));
    let api = MockApi::gated(RemoteState::default(), gate.clone());

    let orchestrator = Arc::new(SyncOrchestrator::new(
        api.clone(),
        store.clone(),
        UploadPipeline::default(),
    ));

    // First pass parks inside the location flush.
    let first = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_sync().await })
    };
    while api.location_entered.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }

    // Re-entrant call must be a no-op; if it ran a pass it would park on the
    // gate too and this test would never finish.
    orchestrator.run_sync().await;
    assert_eq!(api.location_entered.load(Ordering::SeqCst), 1);

    gate.add_permits(1);
    first.await.unwrap();
    assert_eq!(api.location_entered.load(Ordering::SeqCst), 1);

    // Guard cleared: the next trigger runs a fresh pass.
    store.buffer_location(12.9, 77.5, 5.0, 2_000).unwrap();
    gate.add_permits(1);
    orchestrator.run_sync().await;
    assert_eq!(api.location_entered.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_trigger_channel_drives_passes_until_closed() {
    let store = Arc::new(SurveyStore::open_in_memory().unwrap());
    store.buffer_location(12.9, 77.5, 5.0, 1_000).unwrap();

    let api = MockApi::new(RemoteState::default());
    let orchestrator = Arc::new(SyncOrchestrator::new(
        api.clone(),
        store.clone(),
        UploadPipeline::default(),
    ));

    let (triggers, rx) = tokio::sync::mpsc::channel(4);
    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run_on_triggers(rx).await })
    };

    triggers.send(SyncTrigger::Startup).await.unwrap();
    triggers.send(SyncTrigger::ConnectivityRegained).await.unwrap();
    drop(triggers);
    runner.await.unwrap();

    // The first pass flushed the buffer; the second had nothing left to send.
    assert_eq!(api.state.lock().unwrap().location_updates.len(), 1);
    assert_eq!(api.location_entered.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_location_flush_sends_only_latest_then_clears() {
    let store = Arc::new(SurveyStore::open_in_memory().unwrap());
    store.buffer_location(1.0, 1.0, 5.0, 100).unwrap();
    store.buffer_location(2.0, 2.0, 5.0, 300).unwrap();
    store.buffer_location(1.5, 1.5, 5.0, 200).unwrap();

    let api = MockApi::new(RemoteState::default());
    let orchestrator =
        SyncOrchestrator::new(api.clone(), store.clone(), UploadPipeline::default());
    orchestrator.run_sync().await;

    let state = api.state.lock().unwrap();
    assert_eq!(state.location_updates.len(), 1);
    assert_eq!(state.location_updates[0].lat, 2.0);
    drop(state);
    assert!(store.get_buffered_locations().unwrap().is_empty());
}

#[tokio::test]
async fn test_location_flush_failure_keeps_buffer() {
    let store = Arc::new(SurveyStore::open_in_memory().unwrap());
    store.buffer_location(1.0, 1.0, 5.0, 100).unwrap();

    let api = MockApi::new(RemoteState {
        fail_location: true,
        ..Default::default()
    });
    let orchestrator =
        SyncOrchestrator::new(api.clone(), store.clone(), UploadPipeline::default());
    orchestrator.run_sync().await;

    assert_eq!(store.get_buffered_locations().unwrap().len(), 1);
}

#[tokio::test]
async fn test_draft_round_trip_matches_online_submission() {
    let steps = vec![checklist_step("s1"), trace_step("s2")];
    let points = [
        GpsPoint {
            lat: 12.9716,
            lng: 77.5946,
            accuracy: 4.0,
            timestamp: 1_000,
        },
        GpsPoint {
            lat: 12.9720,
            lng: 77.5950,
            accuracy: 4.0,
            timestamp: 2_000,
        },
    ];

    let fill = |session: &mut SurveySession| {
        session.set_response(completed(
            "s1",
            StepKind::Checklist,
            serde_json::Value::String("clear".to_string()),
        ));
        for p in points.iter().copied() {
            session.add_gps_point(p);
        }
        let trace = session.finish_trace().unwrap();
        session.set_response(completed(
            "s2",
            StepKind::GpsTrace,
            serde_json::Value::String(trace),
        ));
    };

    // Online path.
    let mut online = SurveySession::new();
    online.init("job-5", "tmpl-1", steps.clone());
    fill(&mut online);
    let direct = online.build_submission().unwrap();

    // Offline path: identical inputs through the draft.
    let store = SurveyStore::open_in_memory().unwrap();
    let mut offline = SurveySession::new();
    offline.init("job-5", "tmpl-1", steps);
    fill(&mut offline);
    offline.save_offline(&store).unwrap();

    let draft = store.get_survey_draft("job-5").unwrap().unwrap();
    let replayed = submission_from_draft(&draft).unwrap();

    assert_eq!(replayed.responses, direct.responses);
    assert_eq!(replayed.gps_trail_geojson, direct.gps_trail_geojson);
    assert_eq!(replayed.template_id, direct.template_id);
}

#[tokio::test]
async fn test_submit_failure_leaves_draft_for_a_later_pass() {
    let dir = tempfile::tempdir().unwrap();
    let file_a = write_capture_file(&dir, "a.jpg", b"first");
    let file_b = write_capture_file(&dir, "b.jpg", b"second");

    let store = Arc::new(SurveyStore::open_in_memory().unwrap());
    let api = MockApi::new(RemoteState {
        fail_submit: true,
        ..Default::default()
    });

    let task = store
        .enqueue_upload(seed_for_file("job-3", "s1", &file_a))
        .unwrap();
    store
        .save_survey_draft(terrascore_rs::models::SurveyDraft::new(
            "job-3".to_string(),
            "tmpl-1".to_string(),
            r#"{"s1":"uploaded"}"#.to_string(),
            "[]".to_string(),
            Some("2026-08-06T08:00:00+00:00".to_string()),
        ))
        .unwrap();

    let orchestrator =
        SyncOrchestrator::new(api.clone(), store.clone(), UploadPipeline::default());
    orchestrator.run_sync().await;

    // Upload confirmed, submission refused: everything stays for later.
    let done = store.get_upload_task(task.id).unwrap().unwrap();
    assert_eq!(done.status, UploadStatus::Done);
    assert!(store.get_survey_draft("job-3").unwrap().is_some());
    assert!(api.state.lock().unwrap().submissions.is_empty());

    // Remote recovers; the next pass that touches the job completes it.
    api.state.lock().unwrap().fail_submit = false;
    store
        .enqueue_upload(seed_for_file("job-3", "s2", &file_b))
        .unwrap();
    orchestrator.run_sync().await;

    assert_eq!(api.state.lock().unwrap().submissions.len(), 1);
    assert!(store.get_survey_draft("job-3").unwrap().is_none());
    assert!(store.get_upload_task(task.id).unwrap().is_none());
}

#[tokio::test]
async fn test_multipart_proxy_strategy_registers_through_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let file_path = write_capture_file(&dir, "proxy.jpg", b"proxy bytes");

    let store = SurveyStore::open_in_memory().unwrap();
    let api = MockApi::new(RemoteState::default());
    let task = store
        .enqueue_upload(seed_for_file("job-4", "s1", &file_path))
        .unwrap();

    let pipeline = UploadPipeline::new(UploadStrategy::MultipartProxy);
    let key = pipeline.upload(api.as_ref(), &task).await.unwrap();

    assert_eq!(key, "media/job-4/s1/proxy.jpg");
    let state = api.state.lock().unwrap();
    assert_eq!(state.multiparts.len(), 1);
    assert_eq!(state.presign_calls, 0);
    assert_eq!(state.put_calls, 0);
}

#[tokio::test]
async fn test_arrival_rejection_surfaces_and_gate_stays_open() {
    let api = MockApi::new(RemoteState {
        reject_arrival: true,
        ..Default::default()
    });

    let gate = ArrivalGate::new("job-7", 12.9716, 77.5946);
    let result = gate
        .confirm_arrival(api.as_ref(), 12.9716, 77.5946, 8.0)
        .await;
    assert!(matches!(result, Err(TerraError::ArrivalRejected(_))));

    // The gate holds no state; a later attempt can succeed.
    api.state.lock().unwrap().reject_arrival = false;
    gate.confirm_arrival(api.as_ref(), 12.9716, 77.5946, 8.0)
        .await
        .unwrap();
    assert_eq!(api.state.lock().unwrap().arrivals.len(), 1);
}
