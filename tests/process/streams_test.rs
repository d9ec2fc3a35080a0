//! Tests for stdin forwarding and merged output streaming.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use proc_supervisor::process::{
    ExitError, ProcessSupervisor, SupervisorError, DEFAULT_OUTPUT_BUFFER,
};

use super::collect_lines;

#[tokio::test]
async fn lines_arrive_in_order() {
    let mut supervisor = ProcessSupervisor::new("printf", ["a\\nb\\nc\\n"]);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    assert_eq!(collect_lines(out).await, vec!["a", "b", "c"]);
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn stderr_is_merged_into_output() {
    let mut supervisor = ProcessSupervisor::new("sh", ["-c", "echo out; echo err 1>&2"]);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    assert_eq!(collect_lines(out).await, vec!["out", "err"]);
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn stdout_and_stderr_keep_their_interleaving() {
    let script = "for i in 1 2 3 4 5 6 7 8 9 10; do echo o$i; echo e$i >&2; done";
    for _ in 0..5 {
        let mut supervisor = ProcessSupervisor::new("bash", ["-c", script]);
        let out = supervisor.stream_output().unwrap();
        supervisor.start().unwrap();

        let expected: Vec<String> = (1..=10)
            .flat_map(|i| [format!("o{i}"), format!("e{i}")])
            .collect();
        assert_eq!(collect_lines(out).await, expected);
        supervisor.wait().await.unwrap();
    }
}

#[tokio::test]
async fn line_written_across_both_streams_stays_whole() {
    let mut supervisor = ProcessSupervisor::new("sh", ["-c", "printf a; printf 'b\\n' >&2"]);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    assert_eq!(collect_lines(out).await, vec!["ab"]);
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn output_read_after_wait_is_complete() {
    let mut supervisor = ProcessSupervisor::new("seq", ["1", "3000"]);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .unwrap();
    assert_eq!(result, Ok(()));

    let lines = collect_lines(out).await;
    assert!(lines.len() > DEFAULT_OUTPUT_BUFFER);
    let expected: Vec<String> = (1..=3000).map(|i| i.to_string()).collect();
    assert_eq!(lines, expected);
}

#[tokio::test]
async fn output_works_as_stream() {
    let mut supervisor = ProcessSupervisor::new("seq", ["1", "5"]);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    let lines: Vec<String> = out.collect().await;
    assert_eq!(lines, vec!["1", "2", "3", "4", "5"]);
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn stream_ends_only_after_completion() {
    let mut supervisor = ProcessSupervisor::new("sh", ["-c", "echo one; sleep 0.2; echo two"]);
    let handle = supervisor.handle();
    let mut out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();

    while out.next_line().await.is_some() {}
    assert!(handle.is_completed());
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn dropped_output_consumer_does_not_block_child() {
    let mut supervisor = ProcessSupervisor::new("seq", ["1", "20000"]);
    let out = supervisor.stream_output().unwrap();
    supervisor.start().unwrap();
    drop(out);

    let result = tokio::time::timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .unwrap();
    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn second_streams_are_rejected() {
    let mut supervisor = ProcessSupervisor::new("echo", ["Hello, World!"]);
    supervisor.stream_output().unwrap();
    supervisor.open_input_stream().unwrap();

    assert!(matches!(
        supervisor.stream_output(),
        Err(SupervisorError::OutputStreamAlreadySet)
    ));
    assert!(matches!(
        supervisor.open_input_stream(),
        Err(SupervisorError::InputStreamAlreadySet)
    ));
}

#[tokio::test]
async fn input_is_echoed_back() {
    let mut supervisor = ProcessSupervisor::new("bash", ["-c", "read name; echo $name;"]);
    let out = supervisor.stream_output().unwrap();
    let mut input = supervisor.open_input_stream().unwrap();
    supervisor.start().unwrap();

    tokio::spawn(async move {
        input.write_all(b"Quinten").await.unwrap();
        input.shutdown().await.unwrap();
    });

    assert_eq!(collect_lines(out).await, vec!["Quinten"]);
    assert_eq!(supervisor.wait().await, Ok(()));
}

#[tokio::test]
async fn input_written_before_start_is_delivered() {
    let mut supervisor = ProcessSupervisor::new("cat", Vec::<String>::new());
    let out = supervisor.stream_output().unwrap();
    let mut input = supervisor.open_input_stream().unwrap();

    input.write_all(b"early\nbird\n").await.unwrap();
    input.shutdown().await.unwrap();
    supervisor.start().unwrap();

    assert_eq!(collect_lines(out).await, vec!["early", "bird"]);
    supervisor.wait().await.unwrap();
}

#[tokio::test]
async fn dropping_input_closes_child_stdin() {
    let mut supervisor = ProcessSupervisor::new("cat", Vec::<String>::new());
    let input = supervisor.open_input_stream().unwrap();
    supervisor.start().unwrap();
    drop(input);

    let result = tokio::time::timeout(Duration::from_secs(10), supervisor.wait())
        .await
        .unwrap();
    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn input_fails_after_completion() {
    let mut supervisor = ProcessSupervisor::new("cat", Vec::<String>::new());
    let mut input = supervisor.open_input_stream().unwrap();
    supervisor.start().unwrap();

    supervisor.kill();
    assert_eq!(supervisor.wait().await, Err(ExitError::Canceled));

    let err = input.write_all(b"too late").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn without_output_stream_output_is_discarded() {
    let mut supervisor = ProcessSupervisor::new("echo", ["nobody is listening"]);
    supervisor.start().unwrap();
    assert_eq!(supervisor.wait().await, Ok(()));
}
