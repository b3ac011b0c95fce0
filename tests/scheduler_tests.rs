//! Admission, worker pool bounds and cancellation through the public scheduler API.


use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use media_relay::jobs::JobSnapshot;
use media_relay::scheduler::SchedulerLimits;
use media_relay::{
    AdmissionError, ChatFrontend, FailureReason, IncomingMessage, JobState, Pipeline,
    Requester, Scheduler,
};
use test_harness::{
    assert_eventually, leftover_entries, test_config, wait_for, RecordingChat, ScriptedRunner,
    Sent, Step,
};

const SLOW: Duration = Duration::from_secs(30);

struct Fixture {
    scheduler: Scheduler,
    runner: Arc<ScriptedRunner>,
    chat: Arc<RecordingChat>,
    root: tempfile::TempDir,
}

fn start(runner: ScriptedRunner, workers: usize, backlog_capacity: usize) -> Fixture {
    start_with_chat(runner, RecordingChat::new(), workers, backlog_capacity)
}

fn start_with_chat(
    runner: ScriptedRunner,
    chat: RecordingChat,
    workers: usize,
    backlog_capacity: usize,
) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let runner = Arc::new(runner);
    let chat = Arc::new(chat);
    let pipeline = Arc::new(Pipeline::new(
        &test_config(root.path()),
        runner.clone(),
        chat.clone(),
    ));
    let scheduler = Scheduler::start(
        SchedulerLimits {
            workers,
            per_user_limit: 1,
            backlog_capacity,
            max_url_length: 2048,
        },
        pipeline,
    );
    Fixture {
        scheduler,
        runner,
        chat,
        root,
    }
}

fn slow_runner() -> ScriptedRunner {
    ScriptedRunner::new(Step::produce_after(10, SLOW), Step::produce(10))
}

async fn wait_terminal(mut rx: watch::Receiver<JobSnapshot>) -> JobSnapshot {
    let snapshot = tokio::time::timeout(
        Duration::from_secs(10),
        rx.wait_for(|s| s.state.is_terminal()),
    )
    .await
    .expect("job did not finish in time")
    .expect("status channel closed early")
    .clone();
    snapshot
}

async fn wait_running(scheduler: &Scheduler, running: usize) {
    let scheduler = scheduler.clone();
    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            async move { scheduler.stats().running == running }
        },
        Duration::from_secs(5),
        "workers did not pick up jobs",
    )
    .await;
}

#[tokio::test]
async fn test_at_most_n_jobs_run_concurrently() {
    let fx = start(
        ScriptedRunner::new(
            Step::produce_after(64, Duration::from_millis(100)),
            Step::produce_after(64, Duration::from_millis(100)),
        ),
        2,
        50,
    );

    let watches: Vec<watch::Receiver<JobSnapshot>> = (0..6)
        .map(|user| {
            let id = fx
                .scheduler
                .submit(
                    Requester::new(user.to_string()),
                    &format!("https://example.com/{}", user),
                )
                .unwrap();
            fx.scheduler.watch(&id).unwrap()
        })
        .collect();

    for rx in watches {
        assert_eq!(wait_terminal(rx).await.state, JobState::Succeeded);
    }

    let chat = fx.chat.clone();
    assert_eventually(
        || {
            let chat = chat.clone();
            async move { chat.sent().len() == 6 }
        },
        Duration::from_secs(5),
        "every job should deliver one file",
    )
    .await;

    assert_eq!(fx.runner.max_concurrent(), 2, "both workers should be busy at once");
    assert!(fx.chat.sent().iter().all(|s| matches!(s, Sent::File { .. })));

    fx.scheduler.shutdown().await;
    assert!(leftover_entries(fx.root.path()).is_empty());
}

#[tokio::test]
async fn test_second_request_is_rate_limited() {
    let fx = start(
        ScriptedRunner::new(
            Step::produce_after(10, Duration::from_millis(300)),
            Step::produce(10),
        ),
        1,
        50,
    );
    let user = Requester::new("1");

    let first = fx
        .scheduler
        .submit(user.clone(), "https://example.com/one")
        .unwrap();
    let first_status = fx.scheduler.watch(&first).unwrap();
    assert_eq!(
        fx.scheduler.submit(user.clone(), "https://example.com/two"),
        Err(AdmissionError::RateLimited)
    );
    // other users are unaffected
    assert!(fx
        .scheduler
        .submit(Requester::new("2"), "https://example.com/three")
        .is_ok());

    wait_terminal(first_status).await;
    let scheduler = fx.scheduler.clone();
    assert!(
        wait_for(
            || {
                let scheduler = scheduler.clone();
                async move { scheduler.status(&first).is_none() }
            },
            Duration::from_secs(5),
        )
        .await
    );

    assert!(fx
        .scheduler
        .submit(user, "https://example.com/two")
        .is_ok());
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_invalid_input_creates_no_record() {
    let fx = start(ScriptedRunner::succeeding(), 1, 50);
    let user = Requester::new("5");

    for bad in ["", "   ", "not a url", "ftp://example.com/file", "https://"] {
        assert!(
            matches!(
                fx.scheduler.submit(user.clone(), bad),
                Err(AdmissionError::InvalidInput(_))
            ),
            "{bad:?} should be rejected"
        );
    }

    assert!(fx.scheduler.jobs_for(&user).is_empty());
    assert_eq!(fx.scheduler.stats().queued, 0);
    assert!(fx.runner.calls().is_empty());
    // the rejected attempts do not count against the user
    assert!(fx.scheduler.submit(user, "https://example.com/ok").is_ok());
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_full_backlog_is_overloaded() {
    let fx = start(slow_runner(), 1, 2);

    fx.scheduler
        .submit(Requester::new("1"), "https://example.com/1")
        .unwrap();
    wait_running(&fx.scheduler, 1).await;

    fx.scheduler
        .submit(Requester::new("2"), "https://example.com/2")
        .unwrap();
    fx.scheduler
        .submit(Requester::new("3"), "https://example.com/3")
        .unwrap();
    assert_eq!(
        fx.scheduler
            .submit(Requester::new("4"), "https://example.com/4"),
        Err(AdmissionError::Overloaded)
    );

    let stats = fx.scheduler.stats();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.running, 1);
    assert_eq!(stats.workers, 1);
    assert_eq!(stats.backlog_capacity, 2);

    fx.scheduler.shutdown().await;

    // every admitted job got exactly one cancellation notice
    for user in 1..=3 {
        let sent = fx.chat.sent_to(&Requester::new(user.to_string()));
        assert_eq!(sent.len(), 1, "user {user}");
    }
    assert!(fx.chat.sent_to(&Requester::new("4")).is_empty());
    assert!(leftover_entries(fx.root.path()).is_empty());
}

#[tokio::test]
async fn test_idle_workers_absorb_submissions() {
    let fx = start(slow_runner(), 2, 1);

    // back to back, before any worker has picked a job up
    for user in 1..=3 {
        assert!(
            fx.scheduler
                .submit(
                    Requester::new(user.to_string()),
                    &format!("https://example.com/{}", user)
                )
                .is_ok(),
            "user {user} should be admitted"
        );
    }
    assert_eq!(
        fx.scheduler
            .submit(Requester::new("4"), "https://example.com/4"),
        Err(AdmissionError::Overloaded)
    );

    wait_running(&fx.scheduler, 2).await;
    assert_eq!(fx.scheduler.stats().queued, 1);

    fx.scheduler.shutdown().await;
    assert!(leftover_entries(fx.root.path()).is_empty());
}

#[tokio::test]
async fn test_finished_job_frees_requester_during_slow_delivery() {
    let fx = start_with_chat(
        ScriptedRunner::succeeding(),
        RecordingChat::slow_files(Duration::from_secs(2)),
        2,
        10,
    );
    let user = Requester::new("3");

    let first = fx
        .scheduler
        .submit(user.clone(), "https://example.com/first")
        .unwrap();
    let status = fx.scheduler.watch(&first).unwrap();
    assert_eq!(wait_terminal(status).await.state, JobState::Succeeded);

    let scheduler = fx.scheduler.clone();
    let resubmit = user.clone();
    assert_eventually(
        || {
            let scheduler = scheduler.clone();
            let user = resubmit.clone();
            async move {
                scheduler
                    .submit(user, "https://example.com/second")
                    .is_ok()
            }
        },
        Duration::from_secs(1),
        "a succeeded job should not count against its requester",
    )
    .await;
    // the first upload is still in flight
    assert!(fx.chat.sent_to(&user).is_empty());

    let chat = fx.chat.clone();
    assert_eventually(
        || {
            let chat = chat.clone();
            async move { chat.sent().len() == 2 }
        },
        Duration::from_secs(10),
        "both files should be delivered",
    )
    .await;

    fx.scheduler.shutdown().await;
    assert!(leftover_entries(fx.root.path()).is_empty());
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let fx = start(slow_runner(), 1, 10);

    fx.scheduler
        .submit(Requester::new("1"), "https://example.com/running")
        .unwrap();
    wait_running(&fx.scheduler, 1).await;

    let queued = fx
        .scheduler
        .submit(Requester::new("2"), "https://example.com/queued")
        .unwrap();
    let rx = fx.scheduler.watch(&queued).unwrap();

    assert!(fx.scheduler.cancel(&queued).await);
    assert!(!fx.scheduler.cancel(&queued).await);

    let last = rx.borrow().clone();
    assert_eq!(last.history, vec![JobState::Queued, JobState::Cancelled]);
    assert_eq!(last.attempt_count, 0);
    assert_eq!(
        fx.chat.sent_to(&Requester::new("2")),
        vec![Sent::Text {
            to: Requester::new("2"),
            message: FailureReason::Cancelled.notice().to_string(),
        }]
    );
    assert_eq!(fx.scheduler.stats().queued, 0);

    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_job() {
    let fx = start(slow_runner(), 1, 10);
    let user = Requester::new("9");

    let id = fx
        .scheduler
        .submit(user.clone(), "https://example.com/long")
        .unwrap();
    let status = fx.scheduler.watch(&id).unwrap();
    wait_running(&fx.scheduler, 1).await;

    assert_eq!(fx.scheduler.cancel_for(&user).await, 1);
    let last = wait_terminal(status).await;
    assert_eq!(last.state, JobState::Cancelled);
    assert_eq!(last.failure_reason, None);

    let chat = fx.chat.clone();
    assert_eventually(
        || {
            let chat = chat.clone();
            async move { chat.sent().len() == 1 }
        },
        Duration::from_secs(5),
        "cancellation notice not delivered",
    )
    .await;
    assert_eq!(fx.runner.calls(), vec!["yt-dlp"]);

    fx.scheduler.shutdown().await;
    assert!(leftover_entries(fx.root.path()).is_empty());
}

#[tokio::test]
async fn test_shutdown_refuses_new_jobs() {
    let fx = start(ScriptedRunner::succeeding(), 2, 10);
    fx.scheduler.shutdown().await;

    assert_eq!(
        fx.scheduler
            .submit(Requester::new("1"), "https://example.com/late"),
        Err(AdmissionError::ShuttingDown)
    );
}

#[tokio::test]
async fn test_frontend_replies_and_delivers() {
    let fx = start(ScriptedRunner::succeeding(), 1, 10);
    let frontend = ChatFrontend::new(fx.scheduler.clone(), fx.chat.clone());
    let user = Requester::new("77");

    frontend
        .handle(IncomingMessage::new(user.clone(), "/status"))
        .await;
    frontend
        .handle(IncomingMessage::new(user.clone(), "hello"))
        .await;
    frontend
        .handle(IncomingMessage::new(
            user.clone(),
            "please grab https://example.com/song",
        ))
        .await;

    let chat = fx.chat.clone();
    assert_eventually(
        || {
            let chat = chat.clone();
            async move {
                chat.sent()
                    .iter()
                    .any(|s| matches!(s, Sent::File { .. }))
            }
        },
        Duration::from_secs(5),
        "file was not delivered",
    )
    .await;

    let texts: Vec<String> = fx
        .chat
        .sent_to(&user)
        .into_iter()
        .filter_map(|s| match s {
            Sent::Text { message, .. } => Some(message),
            Sent::File { .. } => None,
        })
        .collect();
    assert_eq!(texts.len(), 3);
    assert_eq!(texts[0], "No requests in progress.");
    assert_eq!(
        texts[1],
        ChatFrontend::rejection_text(&AdmissionError::InvalidInput(String::new()))
    );
    assert!(texts[2].contains("working on your link"));

    fx.scheduler.shutdown().await;
}
