mod helpers;

use axum::http::StatusCode;
use sqlx::PgPool;
use uuid::Uuid;

/// §4.2.5: a one-shot job (`schedule: null`) instantiates one
/// `PipelineRun` per entry of the cartesian product of `job_parameters`
/// once started, then completes without a further `next_scheduled_time`.
#[sqlx::test(migrations = "./migrations")]
async fn start_instantiates_one_run_per_parameter_combination_then_completes(pool: PgPool) {
    let (state, cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state.clone());
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = Uuid::new_v4();
    let env_uuid = Uuid::new_v4();
    let step_uuid = Uuid::new_v4();

    cra.seed_image(
        &orchest_api::cra::environment_image_name(&project_uuid, &env_uuid),
        "sha256:abc",
    );

    let (status, created) = helpers::post_json(
        &app,
        "/jobs/",
        serde_json::json!({
            "project_uuid": project_uuid,
            "pipeline_uuid": pipeline_uuid,
            "pipeline_definition": {
                "steps": {
                    step_uuid.to_string(): {
                        "environment": env_uuid.to_string(),
                        "incoming_connections": [],
                    }
                },
                "services": {},
            },
            "job_parameters": [[1, 2], ["a", "b"]],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "DRAFT");
    let job_uuid = created["uuid"].as_str().unwrap().to_string();

    let (status, started) =
        helpers::put_json(&app, &format!("/jobs/{job_uuid}"), serde_json::json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["status"], "STARTED");

    orchest_api::controllers::job::instantiate(&state, Uuid::parse_str(&job_uuid).unwrap())
        .await
        .unwrap();

    let runs = sqlx::query!(
        "SELECT uuid FROM pipeline_runs WHERE job_uuid = $1",
        Uuid::parse_str(&job_uuid).unwrap(),
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(runs.len(), 4);

    let (_, job_now) = helpers::get_json(&app, &format!("/jobs/{job_uuid}")).await;
    assert_eq!(job_now["status"], "SUCCESS");
    assert_eq!(job_now["total_scheduled_executions"], 4);
}

/// §4.2.5 `abort`: cancels all non-terminal runs belonging to the job and
/// marks the job `ABORTED`.
#[sqlx::test(migrations = "./migrations")]
async fn abort_cancels_outstanding_runs(pool: PgPool) {
    let (state, cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state.clone());
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = Uuid::new_v4();
    let env_uuid = Uuid::new_v4();
    let step_uuid = Uuid::new_v4();

    cra.seed_image(
        &orchest_api::cra::environment_image_name(&project_uuid, &env_uuid),
        "sha256:abc",
    );

    let (_, created) = helpers::post_json(
        &app,
        "/jobs/",
        serde_json::json!({
            "project_uuid": project_uuid,
            "pipeline_uuid": pipeline_uuid,
            "pipeline_definition": {
                "steps": {
                    step_uuid.to_string(): {
                        "environment": env_uuid.to_string(),
                        "incoming_connections": [],
                    }
                },
                "services": {},
            },
            "job_parameters": [],
        }),
    )
    .await;
    let job_uuid = created["uuid"].as_str().unwrap().to_string();

    helpers::put_json(&app, &format!("/jobs/{job_uuid}"), serde_json::json!({})).await;
    orchest_api::controllers::job::instantiate(&state, Uuid::parse_str(&job_uuid).unwrap())
        .await
        .unwrap();

    let run = sqlx::query!(
        "SELECT uuid FROM pipeline_runs WHERE job_uuid = $1",
        Uuid::parse_str(&job_uuid).unwrap(),
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    // A one-shot job already completed by the time abort is called; flip
    // it back to STARTED to exercise the cancellation path directly.
    sqlx::query!(
        "UPDATE jobs SET status = 'STARTED' WHERE uuid = $1",
        Uuid::parse_str(&job_uuid).unwrap(),
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query!(
        "UPDATE pipeline_runs SET status = 'STARTED' WHERE uuid = $1",
        run.uuid,
    )
    .execute(&pool)
    .await
    .unwrap();

    let (status, _) = helpers::delete_json(&app, &format!("/jobs/{job_uuid}")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, job_now) = helpers::get_json(&app, &format!("/jobs/{job_uuid}")).await;
    assert_eq!(job_now["status"], "ABORTED");

    let run_uuid = run.uuid;
    let (_, run_now) = helpers::get_json(&app, &format!("/runs/{run_uuid}")).await;
    assert_eq!(run_now["status"], "ABORTED");
}
