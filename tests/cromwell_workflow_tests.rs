//! Remote workflow execution against a mock Cromwell server
//! 针对模拟Cromwell服务器的远程工作流执行

mod common;

use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    routing::{get, post},
    Json, Router,
};
use common::{service_with, write_file};
use mev_engine::execution::{BackendRegistry, CromwellBackend, ExecutionStatus};
use mev_engine::operations::{OperationFiles, SourceRef};
use mev_engine::service::SubmitRequest;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Default)]
struct MockCromwell {
    submissions: Arc<Mutex<Vec<String>>>,
    status: Arc<Mutex<String>>,
    outputs: Arc<Mutex<Value>>,
}

async fn submit(State(mock): State<MockCromwell>, body: Bytes) -> Json<Value> {
    mock.submissions
        .lock()
        .await
        .push(String::from_utf8_lossy(&body).into_owned());
    Json(json!({"id": "3f1c0a52-0000-4000-8000-000000000001", "status": "Submitted"}))
}

async fn status(State(mock): State<MockCromwell>, AxumPath(id): AxumPath<String>) -> Json<Value> {
    Json(json!({"id": id, "status": mock.status.lock().await.clone()}))
}

async fn outputs(State(mock): State<MockCromwell>, AxumPath(id): AxumPath<String>) -> Json<Value> {
    Json(json!({"id": id, "outputs": mock.outputs.lock().await.clone()}))
}

async fn spawn_mock(mock: MockCromwell) -> String {
    let app = Router::new()
        .route("/api/workflows/v1", post(submit))
        .route("/api/workflows/v1/{id}/status", get(status))
        .route("/api/workflows/v1/{id}/outputs", get(outputs))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn alignment_spec() -> Value {
    json!({
        "name": "STAR alignment",
        "description": "Align paired reads",
        "inputs": {
            "r1_files": {
                "name": "R1 reads:",
                "required": true,
                "converter": "cromwell_multiple_resource",
                "spec": {"attribute_type": "DataResource", "resource_types": ["FQ"], "many": true}
            },
            "genome": {
                "name": "Genome:",
                "required": true,
                "converter": "basic",
                "spec": {"attribute_type": "OptionString", "options": ["Ensembl Homo sapiens GRCh38.95", "Ensembl Mus musculus GRCm38.94"]}
            }
        },
        "outputs": {
            "aligned_bams": {
                "spec": {"attribute_type": "DataResource", "resource_types": ["BAM"], "many": true}
            },
            "mapping_rate": {
                "spec": {"attribute_type": "BoundedFloat", "min": 0, "max": 1}
            }
        },
        "mode": "cromwell"
    })
}

fn alignment_files() -> OperationFiles {
    let mut imports = BTreeMap::new();
    imports.insert(
        "star.wdl".to_string(),
        "task align {\n  runtime {\n    docker: \"ghcr.io/web-mev/star\"\n  }\n}\n".to_string(),
    );
    OperationFiles {
        main_wdl: Some(
            "import \"star.wdl\" as star\n\nworkflow StarAlign {\n  Array[File] r1_files\n  String genome\n}\n"
                .to_string(),
        ),
        workflow_inputs: Some(
            r#"{"StarAlign.r1_files": "r1_files", "StarAlign.genome": "genome"}"#.to_string(),
        ),
        imports,
        ..Default::default()
    }
}

#[tokio::test]
async fn workflow_is_submitted_tracked_and_collected() {
    let root = tempfile::tempdir().unwrap();
    let mock = MockCromwell::default();
    *mock.status.lock().await = "Submitted".to_string();
    let base = spawn_mock(mock.clone()).await;

    let engine_root = root.path().join("cromwell");
    std::fs::create_dir_all(&engine_root).unwrap();
    let cromwell = CromwellBackend::new(&base, Duration::from_secs(5))
        .unwrap()
        .with_outputs_root(&engine_root);
    let svc = service_with(root.path(), BackendRegistry::new().with(Arc::new(cromwell)));

    let op = svc
        .ingest(
            &alignment_spec(),
            SourceRef::new("https://github.com/web-mev/star-align", "f00dfeed"),
            alignment_files(),
        )
        .await
        .unwrap();

    let mut reads = Vec::new();
    for name in ["s1_R1.fastq.gz", "s2_R1.fastq.gz"] {
        let path = write_file(root.path(), &format!("resources/{}", name), "@r\nACGT\n+\n!!!!\n");
        let r = svc.add_resource(name, path, None).await.unwrap();
        svc.validate_resource(&r.id, "FQ").await.unwrap();
        reads.push(r.id.to_string());
    }

    let exec = svc
        .submit(SubmitRequest::new(
            op.id,
            json!({"r1_files": reads, "genome": "Ensembl Homo sapiens GRCh38.95"}),
        ))
        .await
        .unwrap();
    assert_eq!(exec.job_handle, "3f1c0a52-0000-4000-8000-000000000001");

    {
        let submissions = mock.submissions.lock().await;
        assert_eq!(submissions.len(), 1);
        let body = &submissions[0];
        assert!(body.contains("StarAlign.r1_files"));
        assert!(body.contains("s1_R1.fastq.gz"));
        // Imports travel in the dependency archive and stay relative
        assert!(body.contains("name=\"workflowDependencies\""));
        assert!(body.contains("import \"star.wdl\" as star"));
        assert!(body.contains("ghcr.io/web-mev/star:f00dfeed"));
    }
    assert!(!exec.execution_dir.join("wdl").exists());

    assert_eq!(svc.advance(&exec.id).await.unwrap().status, ExecutionStatus::Submitted);
    *mock.status.lock().await = "Running".to_string();
    assert_eq!(svc.advance(&exec.id).await.unwrap().status, ExecutionStatus::Running);

    let bam_a = write_file(root.path(), "cromwell/s1.bam", "BAM");
    let bam_b = write_file(root.path(), "cromwell/s2.bam", "BAM");
    *mock.outputs.lock().await = json!({
        "StarAlign.aligned_bams": [bam_a.display().to_string(), bam_b.display().to_string()],
        "StarAlign.mapping_rate": 0.93
    });
    *mock.status.lock().await = "Succeeded".to_string();

    let finished = svc.advance(&exec.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Finished, "errors: {:?}", finished.errors);
    let outputs = finished.outputs.unwrap();
    assert_eq!(outputs["mapping_rate"], json!(0.93));
    let bams = outputs["aligned_bams"].as_array().unwrap();
    assert_eq!(bams.len(), 2);
    for id in bams {
        let id: Uuid = id.as_str().unwrap().parse().unwrap();
        assert_eq!(
            svc.get_resource(&id).await.unwrap().resource_type.as_deref(),
            Some("BAM")
        );
    }
}

#[tokio::test]
async fn unrecognized_engine_status_moves_running_job_to_unknown() {
    let root = tempfile::tempdir().unwrap();
    let mock = MockCromwell::default();
    *mock.status.lock().await = "Running".to_string();
    let base = spawn_mock(mock.clone()).await;

    let cromwell = CromwellBackend::new(&base, Duration::from_secs(5)).unwrap();
    let svc = service_with(root.path(), BackendRegistry::new().with(Arc::new(cromwell)));
    let op = svc
        .ingest(
            &alignment_spec(),
            SourceRef::new("https://github.com/web-mev/star-align", "f00dfeed"),
            alignment_files(),
        )
        .await
        .unwrap();
    let path = write_file(root.path(), "resources/s1_R1.fq", "@r\nACGT\n+\n!!!!\n");
    let r = svc.add_resource("s1_R1.fq", path, None).await.unwrap();
    svc.validate_resource(&r.id, "FQ").await.unwrap();
    let exec = svc
        .submit(SubmitRequest::new(
            op.id,
            json!({"r1_files": [r.id.to_string()], "genome": "Ensembl Mus musculus GRCm38.94"}),
        ))
        .await
        .unwrap();
    assert_eq!(svc.advance(&exec.id).await.unwrap().status, ExecutionStatus::Running);

    // The engine stops reporting a status the tracker understands
    *mock.status.lock().await = "Vanished".to_string();
    let unknown = svc.advance(&exec.id).await.unwrap();
    assert_eq!(unknown.status, ExecutionStatus::Unknown);
    assert!(!unknown.warnings.is_empty());

    *mock.status.lock().await = "Failed".to_string();
    assert_eq!(svc.advance(&exec.id).await.unwrap().status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn outputs_outside_engine_root_fail_the_job() {
    let root = tempfile::tempdir().unwrap();
    let mock = MockCromwell::default();
    *mock.status.lock().await = "Succeeded".to_string();
    let base = spawn_mock(mock.clone()).await;

    let engine_root = root.path().join("cromwell");
    std::fs::create_dir_all(&engine_root).unwrap();
    let cromwell = CromwellBackend::new(&base, Duration::from_secs(5))
        .unwrap()
        .with_outputs_root(&engine_root);
    let svc = service_with(root.path(), BackendRegistry::new().with(Arc::new(cromwell)));
    let op = svc
        .ingest(
            &alignment_spec(),
            SourceRef::new("https://github.com/web-mev/star-align", "f00dfeed"),
            alignment_files(),
        )
        .await
        .unwrap();
    let path = write_file(root.path(), "resources/s1_R1.fq", "@r\nACGT\n+\n!!!!\n");
    let r = svc.add_resource("s1_R1.fq", path, None).await.unwrap();
    svc.validate_resource(&r.id, "FQ").await.unwrap();
    let exec = svc
        .submit(SubmitRequest::new(
            op.id,
            json!({"r1_files": [r.id.to_string()], "genome": "Ensembl Mus musculus GRCm38.94"}),
        ))
        .await
        .unwrap();

    // Another user's file, outside the engine's output tree
    let foreign = write_file(root.path(), "resources/other_user.bam", "BAM");
    *mock.outputs.lock().await = json!({
        "StarAlign.aligned_bams": [foreign.display().to_string()],
        "StarAlign.mapping_rate": 0.5
    });

    let failed = svc.advance(&exec.id).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert!(failed.outputs.is_none());
    assert!(failed.errors.iter().any(|e| e.contains("aligned_bams")), "{:?}", failed.errors);
    assert_eq!(std::fs::read_to_string(&foreign).unwrap(), "BAM");
}
