mod common;

use common::TestResult;
use serde_json::json;

#[tokio::test(flavor = "multi_thread")]
async fn state_persists_across_cells() -> TestResult<()> {
    if common::skip_without_python("state_persists_across_cells") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let first = session
        .call("jupyter_execute_cell", json!({"code": "x = 41\nprint('set')"}))
        .await?;
    assert!(!first.is_error, "{:?}", first.payload);
    assert_eq!(first.status(), "ok");
    assert_eq!(first.stdout(), "set\n");
    assert!(first.payload["session_id"].is_string());

    let second = session
        .call("jupyter_execute_cell", json!({"code": "x + 1"}))
        .await?;
    assert!(!second.is_error, "{:?}", second.payload);
    assert_eq!(second.payload["has_error"], false);
    assert_eq!(second.payload["outputs"][0]["output_type"], "execute_result");
    assert_eq!(second.payload["outputs"][0]["data"]["text/plain"], "42");
    assert!(second.execution_count() > first.execution_count());

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn user_exception_is_a_normal_result() -> TestResult<()> {
    if common::skip_without_python("user_exception_is_a_normal_result") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let result = session
        .call("jupyter_execute_cell", json!({"code": "print('before')\n1 / 0"}))
        .await?;
    assert!(!result.is_error, "{:?}", result.payload);
    assert_eq!(result.status(), "ok");
    assert_eq!(result.category(), "execution_error");
    assert_eq!(result.payload["has_error"], true);
    assert_eq!(result.stdout(), "before\n");
    let error = result.payload["outputs"]
        .as_array()
        .and_then(|outputs| outputs.iter().find(|output| output["output_type"] == "error"))
        .cloned()
        .expect("error output");
    assert_eq!(error["ename"], "ZeroDivisionError");
    assert!(result.payload["remediation"].is_array());

    let report = session.call("jupyter_debug_last_error", json!({})).await?;
    assert_eq!(report.payload["ename"], "ZeroDivisionError");
    assert_eq!(
        report.payload["execution_count"],
        result.payload["execution_count"]
    );

    // The kernel is still usable.
    let next = session
        .call("jupyter_execute_cell", json!({"code": "print('after')"}))
        .await?;
    assert_eq!(next.stdout(), "after\n");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn timeout_keeps_partial_output_and_recovers() -> TestResult<()> {
    if common::skip_without_python("timeout_keeps_partial_output_and_recovers") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let warm = session
        .call("jupyter_execute_cell", json!({"code": "import time"}))
        .await?;
    assert!(!warm.is_error, "{:?}", warm.payload);

    let slow = session
        .call(
            "jupyter_execute_cell",
            json!({
                "code": "print('started', flush=True)\ntime.sleep(3)",
                "timeout": 1
            }),
        )
        .await?;
    assert!(slow.is_error, "{:?}", slow.payload);
    assert_eq!(slow.status(), "error");
    assert_eq!(slow.category(), "timeout");
    assert_eq!(slow.stdout(), "started\n");
    assert!(slow.execution_count() > warm.execution_count());

    let status = session.call("jupyter_kernel_status", json!({})).await?;
    let state = status.payload["state"].as_str().unwrap_or("").to_string();
    assert!(state == "ready" || state == "dead", "state: {state}");

    let next = session
        .call(
            "jupyter_execute_cell",
            json!({"code": "print('recovered')", "timeout": 30}),
        )
        .await?;
    assert!(!next.is_error, "{:?}", next.payload);
    assert!(next.stdout().ends_with("recovered\n"), "{:?}", next.payload);
    assert!(next.execution_count() > slow.execution_count());

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_clears_state_and_keeps_counter() -> TestResult<()> {
    if common::skip_without_python("restart_clears_state_and_keeps_counter") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let before = session
        .call("jupyter_execute_cell", json!({"code": "token = 'kept'"}))
        .await?;
    assert!(!before.is_error, "{:?}", before.payload);

    let restart = session.call("jupyter_restart_kernel", json!({})).await?;
    assert!(!restart.is_error, "{:?}", restart.payload);
    assert_eq!(restart.payload["status"], "started");
    assert!(restart.payload["session_id"].is_string());

    let after = session
        .call("jupyter_execute_cell", json!({"code": "print('token' in globals())"}))
        .await?;
    assert_eq!(after.stdout(), "False\n");
    assert!(after.execution_count() > before.execution_count());

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_idempotent() -> TestResult<()> {
    if common::skip_without_python("shutdown_is_idempotent") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let started = session.call("jupyter_execute_cell", json!({"code": "1"})).await?;
    assert!(!started.is_error, "{:?}", started.payload);

    let first = session.call("jupyter_shutdown_kernel", json!({})).await?;
    assert_eq!(first.payload["shutdown"], "stopped");
    let second = session.call("jupyter_shutdown_kernel", json!({})).await?;
    assert_eq!(second.payload["shutdown"], "not_running");

    let status = session.call("jupyter_kernel_status", json!({})).await?;
    assert_eq!(status.payload["state"], "not_started");
    assert_eq!(status.payload["running"], false);

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn mismatched_session_id_only_warns() -> TestResult<()> {
    if common::skip_without_python("mismatched_session_id_only_warns") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let result = session
        .call(
            "jupyter_execute_cell",
            json!({"code": "print('ran')", "session_id": "someone-else"}),
        )
        .await?;
    assert!(!result.is_error, "{:?}", result.payload);
    assert_eq!(result.stdout(), "ran\n");
    let warnings = result.payload["warnings"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    assert_eq!(warnings.len(), 1);
    assert!(
        warnings[0]
            .as_str()
            .unwrap_or("")
            .starts_with(r#"session_id "someone-else" does not match the active session"#),
        "{warnings:?}"
    );

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn namespace_inspection_lists_user_variables() -> TestResult<()> {
    if common::skip_without_python("namespace_inspection_lists_user_variables") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let setup = session
        .call(
            "jupyter_execute_cell",
            json!({"code": "alpha = [1, 2, 3]\nbeta = {'k': 1}\n_hidden = 0"}),
        )
        .await?;
    assert!(!setup.is_error, "{:?}", setup.payload);

    let namespace = session.call("jupyter_inspect_namespace", json!({})).await?;
    assert!(!namespace.is_error, "{:?}", namespace.payload);
    let names: Vec<&str> = namespace.payload["variables"]
        .as_array()
        .map(|vars| vars.iter().filter_map(|var| var["name"].as_str()).collect())
        .unwrap_or_default();
    assert!(names.contains(&"alpha"), "{names:?}");
    assert!(names.contains(&"beta"), "{names:?}");
    assert!(!names.contains(&"_hidden"), "{names:?}");

    let filtered = session
        .call("jupyter_inspect_namespace", json!({"filter_pattern": "alp"}))
        .await?;
    assert_eq!(filtered.payload["count"], 1);

    let detail = session
        .call("jupyter_inspect_variable", json!({"variable_name": "alpha"}))
        .await?;
    assert!(!detail.is_error, "{:?}", detail.payload);
    assert_eq!(detail.payload["type"], "list");
    assert_eq!(detail.payload["length"], 3);

    let missing = session
        .call("jupyter_inspect_variable", json!({"variable_name": "gamma"}))
        .await?;
    assert!(missing.is_error, "{:?}", missing.payload);

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn run_file_executes_in_the_kernel() -> TestResult<()> {
    if common::skip_without_python("run_file_executes_in_the_kernel") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("script.py"),
        "value = 6 * 7\nprint(f'value={value}')\n",
    )?;
    let session = common::spawn_python_server(dir.path()).await?;

    let result = session
        .call("jupyter_run_file", json!({"file_path": "script.py"}))
        .await?;
    assert!(!result.is_error, "{:?}", result.payload);
    assert_eq!(result.stdout(), "value=42\n");

    let follow_up = session
        .call("jupyter_execute_cell", json!({"code": "print(value)"}))
        .await?;
    assert_eq!(follow_up.stdout(), "42\n");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn start_while_ready_reuses_the_session() -> TestResult<()> {
    if common::skip_without_python("start_while_ready_reuses_the_session") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let first = session.call("jupyter_initialize", json!({})).await?;
    assert!(!first.is_error, "{:?}", first.payload);
    let pid = first.payload["kernel"]["pid"].clone();
    assert!(pid.is_u64(), "{:?}", first.payload);

    let second = session.call("jupyter_initialize", json!({})).await?;
    assert!(!second.is_error, "{:?}", second.payload);
    assert_eq!(second.payload["kernel"]["status"], "already_running");
    assert_eq!(second.payload["kernel"]["pid"], pid);
    assert_eq!(
        second.payload["session_id"],
        first.payload["session_id"]
    );

    let status = session.call("jupyter_kernel_status", json!({})).await?;
    assert_eq!(status.payload["state"], "ready");
    assert_eq!(status.payload["pid"], pid);

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn kernel_exit_mid_execution_is_reported_and_revived() -> TestResult<()> {
    if common::skip_without_python("kernel_exit_mid_execution_is_reported_and_revived") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let warm = session
        .call("jupyter_execute_cell", json!({"code": "print('alive')"}))
        .await?;
    assert_eq!(warm.stdout(), "alive\n");

    let died = session
        .call(
            "jupyter_execute_cell",
            json!({"code": "import os\nos._exit(3)"}),
        )
        .await?;
    assert!(died.is_error, "{:?}", died.payload);
    assert_eq!(died.status(), "error");
    assert_eq!(died.category(), "process_died");
    assert!(died.execution_count() > warm.execution_count());

    let status = session.call("jupyter_kernel_status", json!({})).await?;
    assert_eq!(status.payload["state"], "dead");
    assert_eq!(status.payload["running"], false);

    let revived = session
        .call("jupyter_execute_cell", json!({"code": "print('revived')"}))
        .await?;
    assert!(!revived.is_error, "{:?}", revived.payload);
    assert_eq!(revived.stdout(), "revived\n");
    assert_ne!(revived.payload["session_id"], warm.payload["session_id"]);

    let status = session.call("jupyter_kernel_status", json!({})).await?;
    assert_eq!(status.payload["state"], "ready");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn channel_is_hidden_from_user_code() -> TestResult<()> {
    if common::skip_without_python("channel_is_hidden_from_user_code") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let result = session
        .call(
            "jupyter_execute_cell",
            json!({"code": concat!(
                "import os\n",
                "print(sorted(k for k in os.environ if k.startswith('JUPYTER_MCP_IPC')))"
            )}),
        )
        .await?;
    assert!(!result.is_error, "{:?}", result.payload);
    assert_eq!(result.stdout(), "[]\n");

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn interleaved_streams_keep_write_order() -> TestResult<()> {
    if common::skip_without_python("interleaved_streams_keep_write_order") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let result = session
        .call(
            "jupyter_execute_cell",
            json!({"code": "import sys\nsys.stdout.write('a')\nsys.stderr.write('b\\n')\nprint('c')"}),
        )
        .await?;
    assert!(!result.is_error, "{:?}", result.payload);
    let streams: Vec<(String, String)> = result.payload["outputs"]
        .as_array()
        .map(|outputs| {
            outputs
                .iter()
                .filter(|output| output["output_type"] == "stream")
                .map(|output| {
                    (
                        output["name"].as_str().unwrap_or("").to_string(),
                        output["text"].as_str().unwrap_or("").to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    insta::assert_debug_snapshot!(streams, @r#"
    [
        (
            "stdout",
            "a",
        ),
        (
            "stderr",
            "b\n",
        ),
        (
            "stdout",
            "c\n",
        ),
    ]
    "#);

    session.cancel().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn profiling_and_variable_listing() -> TestResult<()> {
    if common::skip_without_python("profiling_and_variable_listing") {
        return Ok(());
    }
    let dir = tempfile::tempdir()?;
    let session = common::spawn_python_server(dir.path()).await?;

    let profiled = session
        .call(
            "jupyter_profile_code",
            json!({
                "code": "def triangle(n):\n    return sum(range(n))\ntotal = triangle(5000)\nprint(total)",
                "sort_by": "calls"
            }),
        )
        .await?;
    assert!(!profiled.is_error, "{:?}", profiled.payload);
    assert_eq!(profiled.stdout(), "12497500\n");
    assert_eq!(profiled.payload["sort_by"], "calls");
    assert!(profiled.payload["profile"]["total_calls"].as_u64().unwrap_or(0) > 0);
    let table = profiled.payload["profile"]["stats"].as_str().unwrap_or("");
    assert!(table.contains("triangle"), "{table}");

    let listed = session
        .call("jupyter_list_variables", json!({"var_type": "INT"}))
        .await?;
    assert!(!listed.is_error, "{:?}", listed.payload);
    let names: Vec<&str> = listed.payload["variables"]
        .as_array()
        .map(|vars| vars.iter().filter_map(|var| var["name"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(names, ["total"]);
    assert_eq!(listed.payload["total_variables"], 1);
    assert_eq!(listed.payload["filter"]["type"], "INT");

    let failed = session
        .call("jupyter_execute_cell", json!({"code": "import not_a_real_module_xyz"}))
        .await?;
    assert_eq!(failed.payload["has_error"], true);
    let next = session.call("jupyter_what_next", json!({})).await?;
    assert!(!next.is_error, "{:?}", next.payload);
    assert_eq!(next.payload["kernel_running"], true);
    assert_eq!(next.payload["recommendations"][0]["priority"], 1);
    assert!(
        next.payload["recommendations"][0]["reason"]
            .as_str()
            .unwrap_or("")
            .starts_with("ModuleNotFoundError"),
        "{:?}",
        next.payload
    );

    session.cancel().await?;
    Ok(())
}
