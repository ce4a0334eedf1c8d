//! End-to-end script runs over the in-memory provider.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use wirescript_core::{
    Lifecycle, ScriptError,
    ast::{Location, Region},
    control::FaultOrigin,
    engine::ChannelProvider,
    error::ProgressError,
    prepare_script,
};
use wirescript_harness::{Direction, FaultyProvider, Journal, SimProvider, peer};

fn location(text: &str) -> Location {
    Location::parse(text).unwrap()
}

fn provider(sim: &SimProvider) -> Arc<dyn ChannelProvider> {
    Arc::new(sim.clone())
}

#[tokio::test]
async fn ping_pong_within_one_script() {
    let sim = SimProvider::new();
    let script = r#"
accept "tcp://localhost:9000"
read "ping"
write "pong"

connect "tcp://localhost:9000"
write "ping"
read "pong"
"#;

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    assert!(run.start());
    let outcome = run.finished().await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert!(outcome.notified.is_empty());
    assert!(outcome.awaiting.is_empty());
    assert!(outcome.streams[0].observed.contains("read \"ping\""));
    assert!(outcome.streams[1].observed.contains("write \"ping\""));
}

#[tokio::test]
async fn accept_stream_against_live_peer() {
    let sim = SimProvider::new();
    let script = "accept \"tcp://localhost:9100\"\nread \"hello\"\nwrite \"world\"\n";

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    run.start();

    let mut io = sim.dial(&location("tcp://localhost:9100")).unwrap();
    peer::send(&mut io, b"hello").await.unwrap();
    peer::expect(&mut io, b"world").await.unwrap();
    assert!(peer::drain(&mut io).await.unwrap().is_empty());

    assert!(run.finished().await.is_success());
}

#[tokio::test]
async fn mismatch_fails_with_region() {
    let sim = SimProvider::new();
    let script = "accept \"tcp://localhost:9150\"\nread \"hello\"\nwrite \"world\"\n";

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    run.start();

    let mut io = sim.dial(&location("tcp://localhost:9150")).unwrap();
    peer::send(&mut io, b"hellx").await.unwrap();
    let _ = peer::drain(&mut io).await;

    let outcome = run.finished().await;
    assert!(!outcome.is_success());
    assert!(matches!(
        outcome.root_cause(),
        Some(ScriptError::Progress(ProgressError { region, .. })) if *region == Region::new(2, 1)
    ));
    assert!(outcome.streams[0].observed.contains("# accept"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn await_orders_across_streams() {
    let journal = Journal::new();
    let sim = SimProvider::new().with_journal(journal.clone());
    let mut first = sim.listen(&location("tcp://localhost:9300")).unwrap();
    let mut second = sim.listen(&location("tcp://localhost:9301")).unwrap();
    let script = r#"
accept "tcp://localhost:9200"
read "a"
notify got_a

connect "tcp://localhost:9300"
await got_a
write "b"

connect "tcp://localhost:9301"
await got_a
write "c"
write flush
write "d"
"#;

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    assert_eq!(run.user_barriers(), vec!["got_a".to_string()]);
    journal.watch_barriers(&run.handle());
    run.start();

    let mut first = first.accept().await.unwrap();
    let mut second = second.accept().await.unwrap();
    let mut inbound = sim.dial(&location("tcp://localhost:9200")).unwrap();
    peer::send(&mut inbound, b"a").await.unwrap();
    peer::expect(&mut first, b"b").await.unwrap();
    peer::expect(&mut second, b"cd").await.unwrap();

    let outcome = run.finished().await;
    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(outcome.notified, vec!["got_a".to_string()]);

    let received = journal.position(Direction::Inbound, b"a").unwrap();
    let notified = journal.notified_at("got_a").unwrap();
    assert!(received < notified);

    let after_await: Vec<u64> = ["tcp://localhost:9300", "tcp://localhost:9301"]
        .into_iter()
        .flat_map(|location| journal.sent_on(location))
        .collect();
    assert_eq!(after_await.len(), 3, "{:?}", journal.entries());
    assert!(after_await.iter().all(|&clock| clock > notified), "{:?}", journal.entries());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_fault_interrupts_finish_waiter_once() {
    let script = "connect \"tcp://localhost:9310\"\nwrite \"boom\"\nwrite \"never\"\n";
    let run = prepare_script(script, Arc::new(FaultyProvider)).await.unwrap();

    let lifecycle = Lifecycle::new();
    lifecycle.notify_prepared().unwrap();
    lifecycle.capture_worker_faults(run.handle().faults());
    let interruptions = Arc::new(AtomicUsize::new(0));
    let waiter = tokio::spawn({
        let lifecycle = lifecycle.clone();
        let interruptions = Arc::clone(&interruptions);
        async move {
            let outcome = lifecycle.finished().await;
            if outcome.is_err() {
                interruptions.fetch_add(1, Ordering::SeqCst);
            }
            outcome
        }
    });

    lifecycle.notify_startable().unwrap();
    run.start();
    let outcome = run.finished().await;

    let cause = waiter.await.unwrap().unwrap_err();
    assert!(matches!(&cause, ScriptError::Fault(text) if text.contains("channel exploded")));
    assert_eq!(interruptions.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.fault(), Some(cause.clone()));
    assert_eq!(outcome.root_cause(), Some(&cause));
    assert!(!lifecycle.capture_fault(FaultOrigin::Worker, ScriptError::Aborted));
    assert_eq!(lifecycle.fault(), Some(cause));
}

#[tokio::test]
async fn controller_notify_is_idempotent() {
    let sim = SimProvider::new();
    let script = "accept \"tcp://localhost:9400\"\nawait go\nwrite \"x\"\n";

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    let handle = run.handle();
    run.start();

    let mut io = sim.dial(&location("tcp://localhost:9400")).unwrap();
    assert!(handle.notify("go"));
    assert!(!handle.notify("go"));
    assert!(!handle.notify("missing"));
    peer::expect(&mut io, b"x").await.unwrap();

    let outcome = run.finished().await;
    assert!(outcome.is_success());
    assert_eq!(outcome.notified, vec!["go".to_string()]);
}

#[tokio::test]
async fn late_listeners_fire_immediately() {
    let sim = SimProvider::new();
    let script = "accept \"tcp://localhost:9450\"\nawait go\n";

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    let handle = run.handle();
    run.start();
    let _io = sim.dial(&location("tcp://localhost:9450")).unwrap();
    handle.notify("go");
    run.finished().await;

    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    handle.barrier("go").unwrap().add_listener(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let count = Arc::clone(&fired);
    handle.completion().add_listener(move |outcome| {
        assert!(outcome.is_ok());
        count.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_notifier_abandons_barrier() {
    let sim = SimProvider::new();
    let script = r#"
accept "tcp://localhost:9500"
read "ok"
notify done

accept "tcp://localhost:9501"
await done
write "late"
"#;

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    run.start();

    let mut first = sim.dial(&location("tcp://localhost:9500")).unwrap();
    let mut second = sim.dial(&location("tcp://localhost:9501")).unwrap();
    peer::send(&mut first, b"no").await.unwrap();

    let outcome = run.finished().await;
    assert!(matches!(outcome.root_cause(), Some(ScriptError::Progress(_))));
    assert!(matches!(
        &outcome.streams[1].result,
        Err(ScriptError::BarrierAbandoned { name, .. }) if name == "done"
    ));
    assert_eq!(outcome.awaiting, vec!["done".to_string()]);
    assert!(peer::drain(&mut second).await.unwrap().is_empty());
}

#[tokio::test]
async fn abort_cancels_running_streams() {
    let sim = SimProvider::new();
    let script = "accept \"tcp://localhost:9600\"\nread \"never\"\n";

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    let handle = run.handle();
    run.start();
    let _io = sim.dial(&location("tcp://localhost:9600")).unwrap();
    tokio::task::yield_now().await;
    handle.abort();

    let outcome = run.finished().await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.root_cause(), Some(&ScriptError::Aborted));
    assert!(handle.completion().outcome().is_some_and(|o| o.is_err()));
}

#[tokio::test]
async fn abort_before_start_runs_nothing() {
    let sim = SimProvider::new();
    let script = "accept \"tcp://localhost:9650\"\nwrite \"x\"\n";
    let run = prepare_script(script, provider(&sim)).await.unwrap();
    run.abort();
    assert!(!run.start());

    let outcome = run.finished().await;
    assert_eq!(outcome.streams[0].completed, 0);
    assert_eq!(outcome.root_cause(), Some(&ScriptError::Aborted));
}

#[tokio::test]
async fn captured_bytes_are_echoed() {
    let sim = SimProvider::new();
    let script =
        "accept \"tcp://localhost:9700\"\nread ([0..4]:token) \"\\n\"\nwrite \"got \" ${token}\n";

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    run.start();

    let mut io = sim.dial(&location("tcp://localhost:9700")).unwrap();
    peer::send(&mut io, b"abcd\n").await.unwrap();
    peer::expect(&mut io, b"got abcd").await.unwrap();
    assert!(run.finished().await.is_success());
}

#[tokio::test]
async fn advisories_cross_associated_streams() {
    let sim = SimProvider::new();
    let script = r#"
accept "tcp://localhost:9800"
read advised note "hi"
write "done"

connect "tcp://localhost:9800"
write advise note "hi"
read "done"
"#;

    let run = prepare_script(script, provider(&sim)).await.unwrap();
    run.start();
    let outcome = run.finished().await;
    assert!(outcome.is_success(), "{outcome:?}");
}

#[tokio::test]
async fn bind_conflict_fails_prepare() {
    let sim = SimProvider::new();
    let _held = sim.listen(&location("tcp://localhost:9900")).unwrap();

    let result = prepare_script("accept \"tcp://localhost:9900\"\n", provider(&sim)).await;
    assert!(matches!(
        result,
        Err(ScriptError::Connection { region, .. }) if region == Region::new(1, 1)
    ));
}

#[tokio::test]
async fn validation_failure_names_barrier() {
    let sim = SimProvider::new();
    let script = "accept \"tcp://localhost:9950\"\nawait b1\n";
    let result = prepare_script(script, provider(&sim)).await;
    let Err(err) = result else {
        panic!("unresolved barrier should fail prepare");
    };
    assert_eq!(err.summary(), "validation error: barrier b1");
}
