mod helpers;

use axum::http::StatusCode;
use sqlx::PgPool;
use uuid::Uuid;

fn pipeline_definition(step_uuid: Uuid, env_uuid: Uuid) -> serde_json::Value {
    serde_json::json!({
        "steps": {
            step_uuid.to_string(): {
                "environment": env_uuid.to_string(),
                "incoming_connections": [],
            }
        },
        "services": {},
    })
}

/// Scenario 2: creating a run referencing an environment with no
/// materialized image fails with `ImageNotFound`; once the image exists,
/// the run is created and `PipelineRunImageMapping` pins exactly one row.
#[sqlx::test(migrations = "./migrations")]
async fn create_fails_without_an_image_then_succeeds_once_one_exists(pool: PgPool) {
    let (state, cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state);
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = Uuid::new_v4();
    let env_uuid = Uuid::new_v4();
    let step_uuid = Uuid::new_v4();

    let body = serde_json::json!({
        "project_uuid": project_uuid,
        "pipeline_uuid": pipeline_uuid,
        "kind": "non_interactive",
        "pipeline_definition": pipeline_definition(step_uuid, env_uuid),
    });

    let (status, resp) = helpers::post_json(&app, "/runs/", body.clone()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp["error"], "ImageNotFoundException");

    cra.seed_image(
        &orchest_api::cra::environment_image_name(&project_uuid, &env_uuid),
        "sha256:abc",
    );

    let (status, resp) = helpers::post_json(&app, "/runs/", body).await;
    assert_eq!(status, StatusCode::CREATED);
    let run_uuid = resp["uuid"].as_str().unwrap().to_string();

    let mappings = sqlx::query!(
        "SELECT orchest_environment_uuid, docker_img_id FROM pipeline_run_image_mappings WHERE run_uuid = $1",
        Uuid::parse_str(&run_uuid).unwrap(),
    )
    .fetch_all(&pool)
    .await
    .unwrap();

    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].orchest_environment_uuid, env_uuid);
    assert!(!mappings[0].docker_img_id.is_empty());
}

/// Scenario 6: terminal write-once. A second PUT with a different
/// terminal status is accepted (200) but leaves the row at its first
/// terminal status.
#[sqlx::test(migrations = "./migrations")]
async fn second_terminal_put_is_accepted_but_does_not_change_status(pool: PgPool) {
    let (state, cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state);
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = Uuid::new_v4();
    let env_uuid = Uuid::new_v4();
    let step_uuid = Uuid::new_v4();

    cra.seed_image(
        &orchest_api::cra::environment_image_name(&project_uuid, &env_uuid),
        "sha256:abc",
    );

    let (_, resp) = helpers::post_json(
        &app,
        "/runs/",
        serde_json::json!({
            "project_uuid": project_uuid,
            "pipeline_uuid": pipeline_uuid,
            "kind": "non_interactive",
            "pipeline_definition": pipeline_definition(step_uuid, env_uuid),
        }),
    )
    .await;
    let run_uuid = resp["uuid"].as_str().unwrap().to_string();

    let (status, _) = helpers::put_json(
        &app,
        &format!("/runs/{run_uuid}"),
        serde_json::json!({ "status": "SUCCESS" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = helpers::put_json(
        &app,
        &format!("/runs/{run_uuid}"),
        serde_json::json!({ "status": "FAILURE" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, row) = helpers::get_json(&app, &format!("/runs/{run_uuid}")).await;
    assert_eq!(row["status"], "SUCCESS");
}

#[sqlx::test(migrations = "./migrations")]
async fn abort_cascades_to_non_terminal_steps(pool: PgPool) {
    let (state, cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state);
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = Uuid::new_v4();
    let env_uuid = Uuid::new_v4();
    let step_uuid = Uuid::new_v4();

    cra.seed_image(
        &orchest_api::cra::environment_image_name(&project_uuid, &env_uuid),
        "sha256:abc",
    );

    let (_, resp) = helpers::post_json(
        &app,
        "/runs/",
        serde_json::json!({
            "project_uuid": project_uuid,
            "pipeline_uuid": pipeline_uuid,
            "kind": "non_interactive",
            "pipeline_definition": pipeline_definition(step_uuid, env_uuid),
        }),
    )
    .await;
    let run_uuid = resp["uuid"].as_str().unwrap().to_string();

    let (status, _) = helpers::delete_json(&app, &format!("/runs/{run_uuid}")).await;
    assert_eq!(status, StatusCode::OK);

    let (_, row) = helpers::get_json(&app, &format!("/runs/{run_uuid}")).await;
    assert_eq!(row["status"], "ABORTED");

    let step = sqlx::query!(
        r#"SELECT status FROM pipeline_run_steps WHERE run_uuid = $1 AND step_uuid = $2"#,
        Uuid::parse_str(&run_uuid).unwrap(),
        step_uuid,
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(step.status, "ABORTED");
}
