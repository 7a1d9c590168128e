mod helpers;

use axum::http::StatusCode;
use sqlx::PgPool;

/// Scenario 4: an active interactive session blocks Jupyter build creation.
#[sqlx::test(migrations = "./migrations")]
async fn jupyter_build_refused_while_session_is_active(pool: PgPool) {
    let (state, _cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state);
    let project_uuid = helpers::seed_project(&pool).await;
    let pipeline_uuid = uuid::Uuid::new_v4();

    let (status, _) = helpers::post_json(
        &app,
        "/sessions/",
        serde_json::json!({
            "project_uuid": project_uuid,
            "pipeline_uuid": pipeline_uuid,
            "project_dir": "/project",
            "pipeline_path": "pipeline.orchest",
            "host_userdir": "/userdir",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = helpers::post_json(&app, "/jupyter-builds/", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap_or_default().contains("SessionInProgress"));

    let (_, builds) = helpers::get_json(&app, "/jupyter-builds/").await;
    assert_eq!(builds.as_array().unwrap().len(), 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn jupyter_build_succeeds_once_no_session_is_active(pool: PgPool) {
    let (state, _cra) = helpers::test_state(pool.clone());
    let app = helpers::test_router(state);

    let (status, body) = helpers::post_json(&app, "/jupyter-builds/", serde_json::json!({})).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "PENDING");
}
