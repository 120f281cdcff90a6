use super::*;
use crate::controller::error::ErrorCategory;
use crate::controller::testing::{self, IMAGE, NAMESPACE, PIPELINE_ID, SERVICE_ID};
use crate::gateway::mock::{Call, Failure, MockGateway, Op};
use crate::gateway::{WorkloadGateway, WorkloadKind};
use crate::model::{Group, PipelineStatus};
use crate::store::PipelineStore;

fn create(kind: WorkloadKind, name: &str) -> Call {
    Call::Create(kind, name.to_string())
}

fn update(kind: WorkloadKind, name: &str) -> Call {
    Call::Update(kind, name.to_string())
}

#[tokio::test]
async fn test_deploy_sandbox_publishes_into_deploy_group() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Wait),
    )
    .await;

    let phase = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap();

    assert_eq!(phase.status, PhaseStatus::Process);
    assert_eq!(phase.kind, PhaseKind::Deploy);
    let snapshot: serde_json::Value =
        serde_json::from_str(phase.deployment.as_deref().unwrap()).unwrap();
    assert_eq!(snapshot["metadata"]["name"], "checkout-42-sandbox-green");
    assert_eq!(snapshot["spec"]["replicas"], 1, "sandbox runs a single pod");

    assert_eq!(
        mocks.gateway.mutations(),
        vec![
            create(WorkloadKind::ConfigMap, "checkout-42-sandbox-green-env"),
            create(WorkloadKind::Service, "checkout-42-sandbox-green"),
            create(WorkloadKind::Deployment, "checkout-42-sandbox-green"),
        ]
    );

    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.lock, PIPELINE_ID.to_string());
    assert_eq!(service.deploy_group, Some(Group::Green));
    assert_eq!(service.online_group, Some(Group::Blue));

    let pipeline = mocks.store.pipeline(PIPELINE_ID).await.unwrap();
    assert_eq!(pipeline.status, PipelineStatus::Process);
}

#[tokio::test]
async fn test_deploy_online_uses_configured_replicas_and_image() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Process),
    )
    .await;

    deploy(&ctx, PIPELINE_ID, "online", "alice").await.unwrap();

    let Some(Workload::Deployment(deployment)) = mocks
        .gateway
        .published(WorkloadKind::Deployment, "checkout-42-online-green")
    else {
        panic!("online deployment not published");
    };
    let spec = deployment.spec.unwrap();
    assert_eq!(spec.replicas, Some(5));
    assert_eq!(
        spec.template.spec.unwrap().containers[0].image.as_deref(),
        Some(IMAGE)
    );
}

#[tokio::test]
async fn test_redeploy_before_convergence_updates() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Wait),
    )
    .await;

    deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap();
    let phase = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap();

    assert_eq!(phase.status, PhaseStatus::Process);
    let mutations = mocks.gateway.mutations();
    assert_eq!(mutations.len(), 6);
    assert_eq!(
        mutations[3..],
        [
            update(WorkloadKind::ConfigMap, "checkout-42-sandbox-green-env"),
            update(WorkloadKind::Service, "checkout-42-sandbox-green"),
            update(WorkloadKind::Deployment, "checkout-42-sandbox-green"),
        ]
    );
}

#[tokio::test]
async fn test_first_rollout_targets_blue() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(None),
        testing::pipeline(PipelineStatus::Wait),
    )
    .await;

    deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap();

    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.deploy_group, Some(Group::Blue));
    assert_eq!(service.online_group, None);
    assert!(mocks
        .gateway
        .published(WorkloadKind::Deployment, "checkout-42-sandbox-blue")
        .is_some());
}

#[tokio::test]
async fn test_non_workload_phases_are_invalid() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Wait),
    )
    .await;

    for phase in ["image", "finish", "canary", ""] {
        let err = deploy(&ctx, PIPELINE_ID, phase, "alice").await.unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidPhase(_)), "{}", phase);
        assert_eq!(err.category(), ErrorCategory::Validation);
    }
    assert!(mocks.gateway.calls().is_empty());
    assert!(mocks.store.phases(PIPELINE_ID).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_preconditions_reject_before_any_mutation() {
    let (ctx, mocks) = Context::new_mock();
    let mut pipeline = testing::pipeline(PipelineStatus::Wait);
    pipeline.image.clear();
    testing::seed(&mocks, testing::service(Some(Group::Blue)), pipeline).await;

    let err = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap_err();
    assert!(matches!(err, WorkflowError::ImageMissing(PIPELINE_ID)));

    mocks
        .store
        .set_pipeline_status(PIPELINE_ID, PipelineStatus::Terminate)
        .await;
    let err = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::PipelineFinished {
            status: PipelineStatus::Terminate,
            ..
        }
    ));

    let err = deploy(&ctx, 999, "sandbox", "alice").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotFound);

    assert!(mocks.gateway.calls().is_empty());
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert!(!service.is_locked());
}

#[tokio::test]
async fn test_service_locked_by_other_pipeline() {
    let (ctx, mocks) = Context::new_mock();
    let mut service = testing::service(Some(Group::Blue));
    service.lock = "6".to_string();
    testing::seed(&mocks, service, testing::pipeline(PipelineStatus::Wait)).await;

    let err = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap_err();

    assert!(matches!(err, WorkflowError::ServiceLocked { ref holder } if holder == "6"));
    assert!(mocks.gateway.calls().is_empty());
    assert_eq!(
        mocks.store.pipeline(PIPELINE_ID).await.unwrap().status,
        PipelineStatus::Wait
    );
}

#[tokio::test]
async fn test_finished_phase_cannot_be_redeployed() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Process),
    )
    .await;
    testing::seed_phase(
        &mocks,
        PhaseKind::Deploy,
        PhaseName::Sandbox,
        PhaseStatus::Success,
    )
    .await;

    let err = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap_err();
    assert!(matches!(err, WorkflowError::PhaseFinished(_)));
    assert!(mocks.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_cluster_rejection_fails_phase() {
    let gateway = MockGateway::new();
    gateway.fail(
        Op::Create,
        "checkout-42-sandbox-green",
        Failure::Status(422),
    );
    let (ctx, mocks) = Context::with_gateway(gateway);
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Wait),
    )
    .await;

    let err = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Rejected);
    assert_eq!(
        testing::phase_status(&mocks, PhaseKind::Deploy, PhaseName::Sandbox).await,
        Some(PhaseStatus::Failed)
    );
}

#[tokio::test]
async fn test_transient_error_leaves_phase_waiting() {
    let gateway = MockGateway::new();
    gateway.fail(
        Op::Exists,
        "checkout-42-sandbox-green",
        Failure::Timeout,
    );
    let (ctx, mocks) = Context::with_gateway(gateway);
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Wait),
    )
    .await;

    let err = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Transient);
    assert_eq!(
        testing::phase_status(&mocks, PhaseKind::Deploy, PhaseName::Sandbox).await,
        Some(PhaseStatus::Wait)
    );
    // Lock stays with the pipeline so a retry can continue
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.lock, PIPELINE_ID.to_string());
}

#[tokio::test]
async fn test_publish_cron_job_creates_then_updates() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Process),
    )
    .await;
    let task = CronTask {
        name: "cleanup".to_string(),
        schedule: "0 * * * *".to_string(),
        command: vec![],
    };

    assert_eq!(
        publish_cron_job(&ctx, PIPELINE_ID, &task).await.unwrap(),
        Applied::Created
    );
    assert_eq!(
        publish_cron_job(&ctx, PIPELINE_ID, &task).await.unwrap(),
        Applied::Updated
    );
    assert!(mocks
        .gateway
        .exists(NAMESPACE, WorkloadKind::CronJob, "checkout-cronjob-42-cleanup")
        .await
        .unwrap());

    let bad = CronTask {
        name: "cleanup-2".to_string(),
        ..task
    };
    let err = publish_cron_job(&ctx, PIPELINE_ID, &bad).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidTaskName(_)));
}

#[tokio::test]
async fn test_failed_republish_keeps_phase_published() {
    let (ctx, mocks) = Context::new_mock();
    testing::seed(
        &mocks,
        testing::service(Some(Group::Blue)),
        testing::pipeline(PipelineStatus::Wait),
    )
    .await;
    deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap();

    mocks.gateway.fail(
        Op::Exists,
        "checkout-42-sandbox-green-env",
        Failure::Timeout,
    );
    let err = deploy(&ctx, PIPELINE_ID, "sandbox", "alice").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transient);
    assert_eq!(
        testing::phase_status(&mocks, PhaseKind::Deploy, PhaseName::Sandbox).await,
        Some(PhaseStatus::Process),
        "a republish must not move the phase back to wait"
    );

    // The green sandbox is still live, so it cannot be skipped by a rollback
    mocks.gateway.recover();
    let err = crate::controller::rollback(&ctx, PIPELINE_ID, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::ProcessingNotRollbackable(_)));
    assert!(mocks.gateway.scale_calls().is_empty());
    assert_eq!(
        mocks.store.pipeline(PIPELINE_ID).await.unwrap().status,
        PipelineStatus::Process
    );
}
