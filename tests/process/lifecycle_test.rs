//! Tests for starting, waiting on and misusing a supervised process.

use std::time::Duration;

use proc_supervisor::config::SupervisorConfig;
use proc_supervisor::process::{ExitError, Outcome, ProcessSupervisor, SupervisorError};

use super::collect_lines;

const WAIT_LIMIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn echo_output_is_captured() {
    let mut supervisor = ProcessSupervisor::new("echo", ["Hello, World!"]);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    let lines = tokio::time::timeout(WAIT_LIMIT, collect_lines(out))
        .await
        .unwrap();
    assert_eq!(lines, vec!["Hello, World!".to_string()]);
    assert_eq!(supervisor.wait().await, Ok(()));
}

#[tokio::test]
async fn natural_exit_reports_status_code() {
    let mut supervisor = ProcessSupervisor::new("sh", ["-c", "exit 3"]);
    supervisor.start().unwrap();

    let err = supervisor.wait().await.unwrap_err();
    assert!(matches!(err, ExitError::Status(_)));
    assert_eq!(err.code(), Some(3));
    assert!(!err.is_terminated());

    let outcome = supervisor.outcome().await;
    assert!(outcome.exited_on_its_own());
    assert_eq!(outcome.code(), Some(3));
}

#[tokio::test]
async fn wait_returns_same_result_every_time() {
    let mut supervisor = ProcessSupervisor::new("sh", ["-c", "exit 4"]);
    supervisor.start().unwrap();

    let handle = supervisor.handle();
    let other = tokio::spawn(async move { handle.wait().await });

    let first = supervisor.wait().await;
    let second = supervisor.wait().await;
    let from_task = other.await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, from_task);
    assert_eq!(first.unwrap_err().code(), Some(4));
}

#[tokio::test]
async fn wait_started_before_start_is_released() {
    let mut supervisor = ProcessSupervisor::new("true", Vec::<String>::new());
    let handle = supervisor.handle();
    let waiter = tokio::spawn(async move { handle.wait().await });

    tokio::task::yield_now().await;
    supervisor.start().unwrap();

    let result = tokio::time::timeout(WAIT_LIMIT, waiter).await.unwrap();
    assert_eq!(result.unwrap(), Ok(()));
    assert!(supervisor.is_completed());
}

#[tokio::test]
async fn completion_is_recorded() {
    let mut supervisor = ProcessSupervisor::new("true", Vec::<String>::new());
    assert!(!supervisor.is_started());
    supervisor.start().unwrap();
    assert!(supervisor.is_started());
    assert!(supervisor.id().is_some());

    supervisor.wait().await.unwrap();
    assert!(supervisor.is_completed());
    assert!(supervisor.try_outcome().is_some_and(|o| o.is_success()));
}

#[tokio::test]
async fn output_stream_after_start_is_rejected() {
    let mut supervisor = ProcessSupervisor::new("echo", ["Hello, World!"]);
    supervisor.start().unwrap();

    let err = supervisor.stream_output().unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyStarted));
    assert!(err.is_contract_violation());
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn input_stream_after_start_is_rejected() {
    let mut supervisor = ProcessSupervisor::new("echo", ["Hello, World!"]);
    supervisor.start().unwrap();

    assert!(matches!(
        supervisor.open_input_stream(),
        Err(SupervisorError::AlreadyStarted)
    ));
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn second_start_is_rejected() {
    let mut supervisor = ProcessSupervisor::new("true", Vec::<String>::new());
    supervisor.start().unwrap();

    assert!(matches!(supervisor.start(), Err(SupervisorError::AlreadyStarted)));
    assert_eq!(supervisor.wait().await, Ok(()));
}

#[tokio::test]
async fn setters_after_start_are_rejected() {
    let mut supervisor = ProcessSupervisor::new("true", Vec::<String>::new());
    supervisor.start().unwrap();

    assert!(supervisor.set_timeout(Duration::from_secs(1)).is_err());
    assert!(supervisor.env("KEY", "value").is_err());
    assert!(supervisor.set_working_dir("/").is_err());
    assert_eq!(supervisor.timeout(), None);
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn missing_program_fails_to_launch() {
    let mut supervisor = ProcessSupervisor::new("proc-supervisor-no-such-program", ["x"]);
    let out = supervisor.stream_output().unwrap();

    let err = supervisor.start().unwrap_err();
    assert!(matches!(err, SupervisorError::NotFound(_)));
    assert!(supervisor.is_completed());
    assert!(matches!(supervisor.outcome().await, Outcome::LaunchFailed(_)));
    assert!(matches!(supervisor.wait().await, Err(ExitError::LaunchFailed(_))));

    // Nothing was captured and the stream is already closed.
    assert!(collect_lines(out).await.is_empty());
    // Nothing left to kill.
    assert!(!supervisor.kill());
}

#[tokio::test]
async fn environment_and_working_dir_are_applied() {
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = ProcessSupervisor::new("sh", ["-c", "echo $GREETING; pwd"]);
    supervisor.env("GREETING", "hello").unwrap();
    supervisor.set_working_dir(dir.path()).unwrap();
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    let lines = collect_lines(out).await;
    let expected_dir = dir.path().canonicalize().unwrap();
    assert_eq!(
        lines,
        vec!["hello".to_string(), expected_dir.display().to_string()]
    );
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn config_environment_is_applied() {
    let mut config = SupervisorConfig::default();
    config
        .env
        .insert("FROM_CONFIG".to_string(), "yes".to_string());

    let mut supervisor = ProcessSupervisor::from_config("sh", ["-c", "echo $FROM_CONFIG"], &config);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    assert_eq!(collect_lines(out).await, vec!["yes".to_string()]);
    supervisor.wait().await.unwrap();
}
