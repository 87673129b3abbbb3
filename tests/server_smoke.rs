mod common;

use common::TestResult;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn lists_every_tool() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let names = session.tool_names().await?;
    insta::assert_debug_snapshot!(names, @r#"
    [
        "jupyter_add_cell",
        "jupyter_create_notebook",
        "jupyter_debug_last_error",
        "jupyter_detect_environment",
        "jupyter_ensure_dependencies",
        "jupyter_execute_cell",
        "jupyter_execute_notebook",
        "jupyter_get_guidance",
        "jupyter_get_notebook_info",
        "jupyter_initialize",
        "jupyter_inspect_namespace",
        "jupyter_inspect_variable",
        "jupyter_kernel_status",
        "jupyter_list_variables",
        "jupyter_profile_code",
        "jupyter_restart_kernel",
        "jupyter_run_file",
        "jupyter_setup_environment",
        "jupyter_shutdown_kernel",
        "jupyter_sync_environment",
        "jupyter_update_cell",
        "jupyter_validate_setup",
        "jupyter_what_next",
    ]
    "#);

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn status_before_start_reports_not_started() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let status = session.call("jupyter_kernel_status", json!({})).await?;
    assert!(!status.is_error);
    assert_eq!(status.status(), "ok");
    assert_eq!(status.payload["state"], "not_started");
    assert_eq!(status.payload["running"], false);
    assert_eq!(status.payload["execution_count"], 0);
    assert_eq!(status.payload["busy"], false);

    let shutdown = session.call("jupyter_shutdown_kernel", json!({})).await?;
    assert!(!shutdown.is_error);
    assert_eq!(shutdown.payload["shutdown"], "not_running");
    assert_eq!(shutdown.payload["running"], false);

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_code_is_rejected_as_invalid_params() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let err = session
        .call_tool_raw("jupyter_execute_cell", json!({"code": "   \n"}))
        .await
        .expect_err("empty code should be rejected");
    assert!(err.to_string().contains("code must not be empty"), "{err}");

    let err = session
        .call_tool_raw("jupyter_execute_cell", json!({"code": "1", "timeout": 0}))
        .await
        .expect_err("zero timeout should be rejected");
    assert!(err.to_string().contains("positive"), "{err}");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_arguments_are_rejected() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let result = session
        .call_tool_raw("jupyter_kernel_status", json!({"verbose": true}))
        .await;
    assert!(result.is_err(), "unexpected success: {result:?}");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn run_file_rejects_non_python_paths() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("notes.txt"), "print(1)\n")?;
    std::fs::write(dir.path().join("blank.py"), "\n\n")?;
    let session = common::spawn_server(dir.path()).await?;

    let wrong_ext = session
        .call("jupyter_run_file", json!({"file_path": "notes.txt"}))
        .await?;
    assert!(wrong_ext.is_error);
    assert_eq!(wrong_ext.category(), "invalid_request");

    let missing = session
        .call("jupyter_run_file", json!({"file_path": "missing.py"}))
        .await?;
    assert!(missing.is_error);
    assert_eq!(missing.category(), "invalid_request");

    let blank = session
        .call("jupyter_run_file", json!({"file_path": "blank.py"}))
        .await?;
    assert!(blank.is_error);
    assert!(
        blank.payload["message"].as_str().unwrap_or("").ends_with("is empty"),
        "{:?}",
        blank.payload
    );

    // None of the rejected requests started a kernel.
    let status = session.call("jupyter_kernel_status", json!({})).await?;
    assert_eq!(status.payload["state"], "not_started");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_notebook_is_a_document_error() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let info = session
        .call(
            "jupyter_get_notebook_info",
            json!({"notebook_path": "absent.ipynb"}),
        )
        .await?;
    assert!(info.is_error);
    assert_eq!(info.status(), "error");
    assert_eq!(info.category(), "document_error");
    assert!(
        info.payload["message"]
            .as_str()
            .unwrap_or("")
            .starts_with("notebook not found"),
        "{:?}",
        info.payload
    );

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn debug_last_error_without_history_is_empty() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let report = session.call("jupyter_debug_last_error", json!({})).await?;
    assert!(!report.is_error);
    assert_eq!(report.payload["has_error"], false);

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn validate_setup_rejects_missing_directory() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let result = session
        .call(
            "jupyter_validate_setup",
            json!({"working_dir": dir.path().join("nowhere").to_string_lossy()}),
        )
        .await?;
    assert!(result.is_error);
    assert_eq!(result.category(), "invalid_request");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn guidance_works_without_a_kernel() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let setup = session
        .call("jupyter_get_guidance", json!({"action": "setup_environment"}))
        .await?;
    assert!(!setup.is_error);
    assert_eq!(setup.payload["topic"], "setup_environment");
    let tools: Vec<&str> = setup.payload["steps"]
        .as_array()
        .map(|steps| steps.iter().filter_map(|step| step["tool"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(tools.first(), Some(&"jupyter_detect_environment"));

    let fallback = session
        .call("jupyter_get_guidance", json!({"action": "dance"}))
        .await?;
    assert_eq!(fallback.payload["topic"], "general");

    let next = session.call("jupyter_what_next", json!({})).await?;
    assert!(!next.is_error);
    assert_eq!(next.payload["kernel_running"], false);
    assert_eq!(
        next.payload["recommendations"][0]["tool"],
        "jupyter_initialize"
    );

    // Neither tool starts a kernel.
    let status = session.call("jupyter_kernel_status", json!({})).await?;
    assert_eq!(status.payload["state"], "not_started");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn profile_code_rejects_unknown_sort_keys() -> TestResult<()> {
    let dir = tempfile::tempdir()?;
    let session = common::spawn_server(dir.path()).await?;

    let err = session
        .call_tool_raw(
            "jupyter_profile_code",
            json!({"code": "sum(range(10))", "sort_by": "alphabetical"}),
        )
        .await
        .expect_err("unknown sort key should be rejected");
    assert!(err.to_string().contains("sort_by"), "{err}");

    session.cancel().await?;
    Ok(())
}
