//! End-to-end lifecycle tests against the scriptable mock kernel service.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use kernel_session::message::{MessageContent, ReplyStatus, StreamName};
use kernel_session::mock::{MockServices, Scripted};
use kernel_session::service::KernelModel;
use kernel_session::{
    Channel, ConnectionStatus, ExecuteOptions, ExecutionPhase, ExecutionStatus, Kernel,
    KernelConnection, KernelEvent, KernelMessage, KernelOptions, KernelSessionError,
    OutputRecord, ProvisionConfig, Provisioner,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::sleep;

async fn ready_kernel(services: &MockServices) -> Arc<Kernel> {
    let kernel = Kernel::new(KernelOptions::new(services.service_manager(), "python3"));
    kernel.ready().await.unwrap();
    kernel
}

async fn next_display_state(events: &mut broadcast::Receiver<KernelEvent>) -> String {
    loop {
        if let KernelEvent::StateChanged(state) = events.recv().await.unwrap() {
            return state.display_state();
        }
    }
}

fn plain_text(record: &OutputRecord) -> Option<&str> {
    match record {
        OutputRecord::ExecuteResult { data, .. } | OutputRecord::DisplayData { data, .. } => {
            data.get("text/plain").and_then(|v| v.as_str())
        }
        OutputRecord::Stream { text, .. } => Some(text.as_str()),
        _ => None,
    }
}

#[tokio::test]
async fn test_execute_result_completes() {
    let services = MockServices::new();
    services.sessions.respond_with(|_| {
        vec![
            Scripted::status(ExecutionStatus::Busy),
            Scripted::execute_result("2"),
            Scripted::reply_ok(),
            Scripted::status(ExecutionStatus::Idle),
        ]
    });
    let kernel = ready_kernel(&services).await;

    let executor = kernel.execute("1+1", ExecuteOptions::default()).unwrap();
    assert_eq!(executor.phase(), ExecutionPhase::Running);

    let outcome = executor.done().await.unwrap();
    assert_eq!(outcome.phase, ExecutionPhase::Completed);

    let outputs = executor.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].output_type(), "execute_result");
    assert_eq!(plain_text(&outputs[0]), Some("2"));
}

#[tokio::test]
async fn test_result_after_reply_is_kept() {
    let services = MockServices::new();
    services.sessions.respond_with(|_| {
        vec![
            Scripted::status(ExecutionStatus::Busy),
            Scripted::reply_ok(),
            Scripted::execute_result("2"),
            Scripted::status(ExecutionStatus::Idle),
        ]
    });
    let kernel = ready_kernel(&services).await;

    let executor = kernel.execute("1+1", ExecuteOptions::default()).unwrap();
    executor.done().await.unwrap();

    let outputs = executor.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(plain_text(&outputs[0]), Some("2"));
}

#[tokio::test]
async fn test_large_stream_burst_is_not_truncated() {
    let services = MockServices::new();
    services.sessions.respond_with(|_| {
        let mut script = vec![Scripted::status(ExecutionStatus::Busy)];
        script.extend((0..3000).map(|i| Scripted::stream(StreamName::Stdout, &format!("{}\n", i))));
        script.push(Scripted::reply_ok());
        script.push(Scripted::status(ExecutionStatus::Idle));
        script
    });
    let kernel = ready_kernel(&services).await;

    let executor = kernel
        .execute("for i in range(3000): print(i)", ExecuteOptions::default())
        .unwrap();
    executor.done().await.unwrap();

    let outputs = executor.outputs();
    assert_eq!(outputs.len(), 3000);
    assert_eq!(plain_text(&outputs[2999]), Some("2999\n"));
}

#[tokio::test]
async fn test_kernel_error_rejects_completion() {
    let services = MockServices::new();
    let traceback = vec!["Traceback".to_string(), "ValueError: boom".to_string()];
    let expected = traceback.clone();
    services.sessions.respond_with(move |_| {
        vec![
            Scripted::error("ValueError", "boom", expected.clone()),
            Scripted::reply_error("ValueError", "boom", expected.clone()),
        ]
    });
    let kernel = ready_kernel(&services).await;

    let executor = kernel
        .execute("raise ValueError('boom')", ExecuteOptions::default())
        .unwrap();
    let err = executor.done().await.unwrap_err();

    assert_eq!(
        err,
        KernelSessionError::execution("ValueError", "boom", traceback)
    );
    let outputs = executor.outputs();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].output_type(), "error");
    assert_eq!(executor.phase(), ExecutionPhase::CompletedWithError);
}

#[tokio::test]
async fn test_suppressed_error_resolves_with_error_record() {
    let services = MockServices::new();
    services.sessions.respond_with(|_| {
        vec![
            Scripted::error("ZeroDivisionError", "division by zero", vec![]),
            Scripted::reply_error("ZeroDivisionError", "division by zero", vec![]),
        ]
    });
    let kernel = ready_kernel(&services).await;

    let options = ExecuteOptions {
        suppress_code_execution_errors: true,
        ..ExecuteOptions::default()
    };
    let executor = kernel.execute("1/0", options).unwrap();
    let outcome = executor.done().await.unwrap();

    assert_eq!(outcome.phase, ExecutionPhase::CompletedWithError);
    assert!(matches!(
        outcome.error,
        Some(KernelSessionError::Execution { ref ename, .. }) if ename == "ZeroDivisionError"
    ));
    assert!(executor.accumulator().has_error());
}

#[tokio::test]
async fn test_update_display_data_overwrites_in_place() {
    let services = MockServices::new();
    services.sessions.respond_with(|_| {
        vec![
            Scripted::display_data("loading", Some("progress")),
            Scripted::stream(StreamName::Stdout, "working\n"),
            Scripted::display_data("chart", None),
            Scripted::update_display_data("done", "progress"),
            Scripted::stream(StreamName::Stdout, "finished\n"),
            Scripted::reply_ok(),
        ]
    });
    let kernel = ready_kernel(&services).await;

    let executor = kernel.execute("run()", ExecuteOptions::default()).unwrap();
    executor.done().await.unwrap();

    let outputs = executor.outputs();
    let texts: Vec<_> = outputs.iter().filter_map(plain_text).collect();
    assert_eq!(texts, vec!["done", "working\n", "chart", "finished\n"]);
    assert!(matches!(
        &outputs[0],
        OutputRecord::DisplayData { display_id: Some(id), .. } if id == "progress"
    ));
}

#[tokio::test]
async fn test_execute_before_ready_returns_none() {
    let services = MockServices::new();
    services.sessions.set_auto_connect(false);
    let kernel = Kernel::new(KernelOptions::new(services.service_manager(), "python3"));

    assert!(kernel.execute("1", ExecuteOptions::default()).is_none());

    let connection = loop {
        if let Some(connection) = services.sessions.last_connection() {
            break connection;
        }
        sleep(Duration::from_millis(5)).await;
    };
    assert!(!kernel.is_ready());
    assert!(kernel.execute("1", ExecuteOptions::default()).is_none());
    assert!(connection.requests().is_empty());

    connection.set_connection_status(ConnectionStatus::Connected);
    kernel.ready().await.unwrap();
    assert!(kernel.execute("1", ExecuteOptions::default()).is_some());
}

#[tokio::test]
async fn test_shutdown_twice_stays_disconnected() {
    let services = MockServices::new();
    let kernel = ready_kernel(&services).await;

    kernel.shutdown().await.unwrap();
    assert_eq!(kernel.connection_state().connection_status, ConnectionStatus::Disconnected);
    kernel.shutdown().await.unwrap();
    assert_eq!(kernel.connection_state().connection_status, ConnectionStatus::Disconnected);
    assert!(kernel.is_shut_down());
}

#[tokio::test]
async fn test_pending_execution_settles_on_shutdown() {
    let services = MockServices::new();
    services
        .sessions
        .respond_with(|_| vec![Scripted::delay(10_000), Scripted::reply_ok()]);
    let kernel = ready_kernel(&services).await;

    let executor = kernel.execute("sleep()", ExecuteOptions::default()).unwrap();
    kernel.shutdown().await.unwrap();

    assert_eq!(
        executor.done().await.unwrap_err(),
        KernelSessionError::KernelShutdown
    );
    assert!(executor.phase().is_terminal());
}

#[tokio::test]
async fn test_single_terminal_phase_ignores_late_reply() {
    let services = MockServices::new();
    let kernel = ready_kernel(&services).await;

    let executor = kernel.execute("1", ExecuteOptions::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut phases = executor.subscribe_phase();
    let observer = {
        let seen = seen.clone();
        tokio::spawn(async move {
            seen.lock().unwrap().push(*phases.borrow_and_update());
            while phases.changed().await.is_ok() {
                seen.lock().unwrap().push(*phases.borrow_and_update());
            }
        })
    };

    let outcome = executor.done().await.unwrap();
    assert_eq!(outcome.phase, ExecutionPhase::Completed);

    let msg_id = executor.msg_id().unwrap();
    let connection = services.sessions.last_connection().unwrap();
    connection.emit(
        KernelMessage::new(
            Channel::Shell,
            "execute_reply",
            MessageContent::ExecuteReply {
                status: ReplyStatus::Error,
                execution_count: None,
                pages: Vec::new(),
                ename: Some("LateError".to_string()),
                evalue: Some("too late".to_string()),
                traceback: Vec::new(),
            },
        )
        .child_of(&msg_id),
    );
    sleep(Duration::from_millis(20)).await;
    observer.abort();

    assert_eq!(executor.phase(), ExecutionPhase::Completed);
    assert!(executor.done().await.is_ok());
    let seen = seen.lock().unwrap().clone();
    let terminal: Vec<_> = seen.iter().filter(|p| p.is_terminal()).collect();
    assert_eq!(terminal, vec![&ExecutionPhase::Completed]);
    assert_eq!(seen.last(), Some(&ExecutionPhase::Completed));
}

#[tokio::test]
async fn test_interrupt_then_restart_keeps_ready() {
    let services = MockServices::new();
    let kernel = ready_kernel(&services).await;
    let connection = services.sessions.last_connection().unwrap();
    let client_before = kernel.client_id().unwrap();
    let mut events = kernel.subscribe();

    connection.set_status(ExecutionStatus::Busy);
    assert_eq!(next_display_state(&mut events).await, "connected-busy");

    kernel.interrupt().await.unwrap();
    kernel.restart().await.unwrap();
    assert_eq!(next_display_state(&mut events).await, "connected-restarting");
    assert_eq!(next_display_state(&mut events).await, "connected-idle");

    assert_eq!(connection.interrupt_count(), 1);
    assert_eq!(connection.restart_count(), 1);
    assert!(kernel.is_ready());
    kernel.ready().await.unwrap();

    let client_after = kernel.client_id().unwrap();
    assert_ne!(client_after, client_before);
    assert_eq!(client_after, connection.client_id());

    while let Ok(event) = events.try_recv() {
        assert_ne!(event, KernelEvent::Ready);
    }
}

#[tokio::test]
async fn test_concurrent_executions_keep_outputs_apart() {
    let services = MockServices::new();
    services.sessions.respond_with(|request| {
        let code = request.code.clone();
        let (first, second) = match code.as_str() {
            "first" => (5, 30),
            "second" => (15, 5),
            _ => (1, 1),
        };
        vec![
            Scripted::status(ExecutionStatus::Busy),
            Scripted::delay(first),
            Scripted::stream(StreamName::Stdout, &format!("{}-1\n", code)),
            Scripted::delay(second),
            Scripted::stream(StreamName::Stdout, &format!("{}-2\n", code)),
            Scripted::reply_ok(),
            Scripted::status(ExecutionStatus::Idle),
        ]
    });
    let kernel = ready_kernel(&services).await;

    let codes = ["first", "second", "third"];
    let executors: Vec<_> = codes
        .iter()
        .map(|code| kernel.execute(code, ExecuteOptions::default()).unwrap())
        .collect();
    let results = join_all(executors.iter().map(|executor| executor.result())).await;

    for (code, result) in codes.iter().zip(results) {
        assert_eq!(result.unwrap(), format!("{}-1\n{}-2\n", code, code));
    }
    assert_ne!(executors[0].msg_id(), executors[1].msg_id());
}

#[tokio::test]
async fn test_outputs_are_published_under_source_id() {
    let services = MockServices::new();
    services.sessions.respond_with(|_| {
        vec![
            Scripted::stream(StreamName::Stdout, "hello\n"),
            Scripted::reply_ok(),
        ]
    });
    let kernel = ready_kernel(&services).await;

    let options = ExecuteOptions {
        source_id: Some("cell-1".to_string()),
        ..ExecuteOptions::default()
    };
    let executor = kernel.execute("print('hello')", options).unwrap();
    executor.done().await.unwrap();

    let store = kernel.store();
    assert_eq!(store.select_execute("cell-1").as_deref(), Some("print('hello')"));
    let outputs = store.select_outputs("cell-1").unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(
        outputs[0].to_json(),
        json!({"output_type": "stream", "name": "stdout", "text": "hello\n"})
    );
}

#[tokio::test]
async fn test_provision_rejects_both_running_selections() {
    let services = MockServices::new();
    let config = ProvisionConfig {
        services: Some(services.service_manager()),
        use_running_kernel_id: Some("abc".to_string()),
        use_running_kernel_index: Some(0),
        ..ProvisionConfig::default()
    };

    let result = Provisioner::new(config).provision().await;
    assert!(matches!(result, Err(KernelSessionError::Configuration(_))));
    assert!(services.sessions.started().is_empty());
}

#[tokio::test]
async fn test_provision_attaches_to_running_kernel() {
    let services = MockServices::new();
    services.kernels.add_running(KernelModel {
        id: "first".to_string(),
        name: "python3".to_string(),
    });
    services.kernels.add_running(KernelModel {
        id: "second".to_string(),
        name: "python3".to_string(),
    });
    let config = ProvisionConfig {
        services: Some(services.service_manager()),
        use_running_kernel_index: Some(1),
        ..ProvisionConfig::default()
    };

    let provisioned = Provisioner::new(config).provision().await.unwrap();
    let kernel = provisioned.kernel.unwrap();
    kernel.ready().await.unwrap();

    assert_eq!(kernel.id().as_deref(), Some("second"));
    assert_eq!(kernel.path().as_deref(), Some("kernel-second"));
}
