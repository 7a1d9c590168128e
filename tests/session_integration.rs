mod helpers;

use axum::http::StatusCode;
use sqlx::PgPool;
use uuid::Uuid;

/// §4.2.3: stopping a session aborts any interactive `PipelineRun`s still
/// outstanding for its `(project_uuid, pipeline_uuid)` and lands the
/// session at `STOPPED`.
#[sqlx::test(migrations = "./migrations")]
async fn stop_cascades_to_interactive_runs(pool: PgPool) {
    let (state, cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state);
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = Uuid::new_v4();
    let env_uuid = Uuid::new_v4();
    let step_uuid = Uuid::new_v4();

    let (status, _) = helpers::post_json(
        &app,
        "/sessions/",
        serde_json::json!({
            "project_uuid": project_uuid,
            "pipeline_uuid": pipeline_uuid,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    cra.seed_image(
        &orchest_api::cra::environment_image_name(&project_uuid, &env_uuid),
        "sha256:abc",
    );

    let (status, run) = helpers::post_json(
        &app,
        "/runs/",
        serde_json::json!({
            "project_uuid": project_uuid,
            "pipeline_uuid": pipeline_uuid,
            "kind": "interactive",
            "pipeline_definition": serde_json::json!({
                "steps": {
                    step_uuid.to_string(): {
                        "environment": env_uuid.to_string(),
                        "incoming_connections": [],
                    }
                },
                "services": {},
            }),
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let run_uuid = run["uuid"].as_str().unwrap().to_string();

    let (status, _) =
        helpers::delete_json(&app, &format!("/sessions/{project_uuid}/{pipeline_uuid}")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, session) =
        helpers::get_json(&app, &format!("/sessions/{project_uuid}/{pipeline_uuid}")).await;
    assert_eq!(session["status"], "STOPPED");

    let (_, run_now) = helpers::get_json(&app, &format!("/runs/{run_uuid}")).await;
    assert_eq!(run_now["status"], "ABORTED");
}

/// I3: a second launch for an already-active `(project_uuid, pipeline_uuid)`
/// is refused rather than creating a duplicate session.
#[sqlx::test(migrations = "./migrations")]
async fn second_launch_for_the_same_pipeline_is_refused(pool: PgPool) {
    let (state, _cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state);
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = Uuid::new_v4();

    let body = serde_json::json!({
        "project_uuid": project_uuid,
        "pipeline_uuid": pipeline_uuid,
    });

    let (status, _) = helpers::post_json(&app, "/sessions/", body.clone()).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _) = helpers::post_json(&app, "/sessions/", body).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
