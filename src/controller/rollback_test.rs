use super::*;
use crate::controller::context::Mocks;
use crate::controller::error::ErrorCategory;
use crate::controller::testing::{self, PIPELINE_ID, SERVICE_ID};
use crate::gateway::mock::{Failure, MockGateway, Op};
use crate::store::PipelineStore;
use cloudevents::AttributesReader;

fn scale(name: &str, replicas: i32) -> (String, i32) {
    (name.to_string(), replicas)
}

/// Both groups running after a finished rollout to green
fn cut_over_cluster() -> MockGateway {
    MockGateway::new()
        .with_deployment("checkout-42-sandbox-blue", 0)
        .with_deployment("checkout-42-online-blue", 0)
        .with_deployment("checkout-42-sandbox-green", 1)
        .with_deployment("checkout-42-online-green", 5)
}

/// Rollout to green in progress: sandbox cut over, online published
fn in_progress_cluster() -> MockGateway {
    MockGateway::new()
        .with_deployment("checkout-42-sandbox-blue", 0)
        .with_deployment("checkout-42-online-blue", 5)
        .with_deployment("checkout-42-sandbox-green", 1)
        .with_deployment("checkout-42-online-green", 5)
}

async fn seed_in_progress(mocks: &Mocks, online: PhaseStatus) {
    let mut service = testing::service(Some(Group::Blue));
    service.lock = PIPELINE_ID.to_string();
    testing::seed(mocks, service, testing::pipeline(PipelineStatus::Process)).await;
    testing::seed_phase(
        mocks,
        PhaseKind::Deploy,
        PhaseName::Sandbox,
        PhaseStatus::Success,
    )
    .await;
    testing::seed_phase(mocks, PhaseKind::Deploy, PhaseName::Online, online).await;
}

async fn assert_rolled_back(mocks: &Mocks, phases: &[PhaseName]) {
    for phase in phases {
        assert_eq!(
            testing::phase_status(mocks, PhaseKind::Rollback, *phase).await,
            Some(PhaseStatus::Success),
            "{} not rolled back",
            phase
        );
    }
}

#[tokio::test]
async fn test_rollback_after_success_destroys_online_group() {
    let (ctx, mocks) = Context::with_gateway(cut_over_cluster());
    let mut service = testing::service(Some(Group::Green));
    service.deploy_group = Some(Group::Blue);
    testing::seed(&mocks, service, testing::pipeline(PipelineStatus::Success)).await;
    for phase in [PhaseName::Sandbox, PhaseName::Online, PhaseName::Finish] {
        testing::seed_phase(&mocks, PhaseKind::Deploy, phase, PhaseStatus::Success).await;
    }

    let pipeline = rollback(&ctx, PIPELINE_ID, "alice").await.unwrap();

    assert_eq!(pipeline.status, PipelineStatus::RollbackSuccess);
    assert_eq!(
        mocks.gateway.scale_calls(),
        vec![
            scale("checkout-42-sandbox-blue", 1),
            scale("checkout-42-sandbox-green", 0),
            scale("checkout-42-online-blue", 5),
            scale("checkout-42-online-green", 0),
        ]
    );
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.online_group, Some(Group::Blue));
    assert_eq!(service.deploy_group, Some(Group::Green));
    assert!(!service.is_locked());
    assert_rolled_back(&mocks, &[PhaseName::Sandbox, PhaseName::Online]).await;

    let events = mocks.events.get_emitted_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ty(), "dev.cdevents.service.rolledback.0.2.0");
}

#[tokio::test]
async fn test_rollback_in_progress_destroys_deploy_group() {
    let (ctx, mocks) = Context::with_gateway(in_progress_cluster());
    seed_in_progress(&mocks, PhaseStatus::Failed).await;

    rollback(&ctx, PIPELINE_ID, "alice").await.unwrap();

    assert_eq!(
        mocks.gateway.scale_calls(),
        vec![
            scale("checkout-42-sandbox-blue", 1),
            scale("checkout-42-sandbox-green", 0),
            scale("checkout-42-online-blue", 5),
            scale("checkout-42-online-green", 0),
        ]
    );
    assert_eq!(mocks.gateway.replicas("checkout-42-online-green"), Some(0));
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.online_group, Some(Group::Blue));
    assert_eq!(service.deploy_group, Some(Group::Green));
    assert!(!service.is_locked());
}

#[tokio::test]
async fn test_rollback_aborts_on_processing_phase() {
    let (ctx, mocks) = Context::with_gateway(in_progress_cluster());
    seed_in_progress(&mocks, PhaseStatus::Process).await;

    let err = rollback(&ctx, PIPELINE_ID, "alice").await.unwrap_err();

    assert!(matches!(err, WorkflowError::ProcessingNotRollbackable(key) if key.name == PhaseName::Online));
    assert_eq!(err.category(), ErrorCategory::Precondition);
    assert!(mocks.gateway.calls().is_empty());
    assert_eq!(
        mocks.store.pipeline(PIPELINE_ID).await.unwrap().status,
        PipelineStatus::Process
    );
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.lock, PIPELINE_ID.to_string());
    assert_eq!(service.online_group, Some(Group::Blue));
}

#[tokio::test]
async fn test_rollback_of_first_rollout_only_drains() {
    let gateway = MockGateway::new().with_deployment("checkout-42-sandbox-blue", 1);
    let (ctx, mocks) = Context::with_gateway(gateway);
    let mut service = testing::service(None);
    service.deploy_group = Some(Group::Blue);
    service.lock = PIPELINE_ID.to_string();
    testing::seed(&mocks, service, testing::pipeline(PipelineStatus::Process)).await;
    testing::seed_phase(
        &mocks,
        PhaseKind::Deploy,
        PhaseName::Sandbox,
        PhaseStatus::Success,
    )
    .await;

    let pipeline = rollback(&ctx, PIPELINE_ID, "alice").await.unwrap();

    assert_eq!(pipeline.status, PipelineStatus::RollbackSuccess);
    assert_eq!(
        mocks.gateway.scale_calls(),
        vec![scale("checkout-42-sandbox-blue", 0)]
    );
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.online_group, None);
    assert_eq!(service.deploy_group, Some(Group::Blue));
    assert!(!service.is_locked());
    assert!(mocks.events.get_emitted_events().is_empty());
}

#[tokio::test]
async fn test_missing_destroy_workload_counts_as_drained() {
    // online-green was rejected by the cluster and never created
    let gateway = MockGateway::new()
        .with_deployment("checkout-42-sandbox-blue", 0)
        .with_deployment("checkout-42-online-blue", 5)
        .with_deployment("checkout-42-sandbox-green", 1);
    let (ctx, mocks) = Context::with_gateway(gateway);
    seed_in_progress(&mocks, PhaseStatus::Failed).await;

    rollback(&ctx, PIPELINE_ID, "alice").await.unwrap();

    assert_rolled_back(&mocks, &[PhaseName::Sandbox, PhaseName::Online]).await;
    assert_eq!(
        mocks.store.pipeline(PIPELINE_ID).await.unwrap().status,
        PipelineStatus::RollbackSuccess
    );
}

#[tokio::test]
async fn test_failed_scale_strands_lock_and_resume_skips_done_phases() {
    let gateway = in_progress_cluster();
    gateway.fail(Op::Scale, "checkout-42-online-green", Failure::Status(500));
    let (ctx, mocks) = Context::with_gateway(gateway);
    seed_in_progress(&mocks, PhaseStatus::Failed).await;

    let err = rollback(&ctx, PIPELINE_ID, "alice").await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::Transient);
    assert_eq!(
        mocks.store.pipeline(PIPELINE_ID).await.unwrap().status,
        PipelineStatus::Rollbacking
    );
    assert_eq!(mocks.store.service(SERVICE_ID).await.unwrap().lock, "alice");
    assert_rolled_back(&mocks, &[PhaseName::Sandbox]).await;
    assert_eq!(
        testing::phase_status(&mocks, PhaseKind::Rollback, PhaseName::Online).await,
        None
    );

    mocks.gateway.recover();
    let before = mocks.gateway.scale_calls().len();
    let pipeline = rollback(&ctx, PIPELINE_ID, "bob").await.unwrap();

    assert_eq!(pipeline.status, PipelineStatus::RollbackSuccess);
    assert_eq!(
        mocks.gateway.scale_calls()[before..],
        [
            scale("checkout-42-online-blue", 5),
            scale("checkout-42-online-green", 0),
        ]
    );
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert!(!service.is_locked());
    assert_eq!(service.online_group, Some(Group::Blue));
}

#[tokio::test]
async fn test_resumed_rollback_after_cutover_keeps_asymmetry() {
    let (ctx, mocks) = Context::with_gateway(cut_over_cluster());
    let mut service = testing::service(Some(Group::Green));
    service.deploy_group = Some(Group::Blue);
    service.lock = "alice".to_string();
    testing::seed(
        &mocks,
        service,
        testing::pipeline(PipelineStatus::Rollbacking),
    )
    .await;
    for phase in [PhaseName::Sandbox, PhaseName::Online, PhaseName::Finish] {
        testing::seed_phase(&mocks, PhaseKind::Deploy, phase, PhaseStatus::Success).await;
    }
    testing::seed_phase(
        &mocks,
        PhaseKind::Rollback,
        PhaseName::Sandbox,
        PhaseStatus::Success,
    )
    .await;

    rollback(&ctx, PIPELINE_ID, "alice").await.unwrap();

    assert_eq!(
        mocks.gateway.scale_calls(),
        vec![
            scale("checkout-42-online-blue", 5),
            scale("checkout-42-online-green", 0),
        ]
    );
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.online_group, Some(Group::Blue));
    assert_eq!(service.deploy_group, Some(Group::Green));
}

#[tokio::test]
async fn test_cannot_roll_back_closed_pipelines() {
    for status in [PipelineStatus::RollbackSuccess, PipelineStatus::Terminate] {
        let (ctx, mocks) = Context::new_mock();
        testing::seed(
            &mocks,
            testing::service(Some(Group::Blue)),
            testing::pipeline(status),
        )
        .await;

        let err = rollback(&ctx, PIPELINE_ID, "alice").await.unwrap_err();

        assert!(matches!(err, WorkflowError::CannotRollback { .. }), "{}", status);
        assert!(mocks.gateway.calls().is_empty());
    }
}

#[tokio::test]
async fn test_rollback_refuses_foreign_lock() {
    let (ctx, mocks) = Context::with_gateway(in_progress_cluster());
    let mut service = testing::service(Some(Group::Blue));
    service.lock = "6".to_string();
    testing::seed(&mocks, service, testing::pipeline(PipelineStatus::Failed)).await;

    let err = rollback(&ctx, PIPELINE_ID, "alice").await.unwrap_err();

    assert!(matches!(err, WorkflowError::ServiceLocked { ref holder } if holder == "6"));
    assert!(mocks.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_rollback_refuses_superseded_release() {
    let (ctx, mocks) = Context::with_gateway(cut_over_cluster());
    let mut service = testing::service(Some(Group::Green));
    service.deploy_group = Some(Group::Blue);
    testing::seed(&mocks, service, testing::pipeline(PipelineStatus::Success)).await;
    for phase in [PhaseName::Sandbox, PhaseName::Online, PhaseName::Finish] {
        testing::seed_phase(&mocks, PhaseKind::Deploy, phase, PhaseStatus::Success).await;
    }
    let mut next = testing::pipeline(PipelineStatus::Wait);
    next.id = PIPELINE_ID + 1;
    mocks.store.insert_pipeline(next).await;

    let err = rollback(&ctx, PIPELINE_ID, "alice").await.unwrap_err();

    assert!(matches!(
        err,
        WorkflowError::Superseded { id: PIPELINE_ID, latest } if latest == PIPELINE_ID + 1
    ));
    assert_eq!(err.category(), ErrorCategory::Precondition);
    assert!(mocks.gateway.calls().is_empty());
    assert_eq!(
        mocks.store.pipeline(PIPELINE_ID).await.unwrap().status,
        PipelineStatus::Success
    );
    let service = mocks.store.service(SERVICE_ID).await.unwrap();
    assert_eq!(service.online_group, Some(Group::Green));
    assert!(!service.is_locked());
}

#[test]
fn test_effective_status_of_resumed_rollback() {
    let mut pipeline = testing::pipeline(PipelineStatus::Rollbacking);
    assert_eq!(effective_status(&pipeline, &[]), PipelineStatus::Process);

    pipeline.status = PipelineStatus::Failed;
    assert_eq!(effective_status(&pipeline, &[]), PipelineStatus::Failed);
}
