//! Sandbox tests

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::*;

const IDENTITY: &str = include_str!("../../tests/scripts/identity.wat");
const COUNTER: &str = include_str!("../../tests/scripts/counter.wat");
const SPIN: &str = include_str!("../../tests/scripts/spin.wat");
const TRAP: &str = include_str!("../../tests/scripts/trap.wat");
const ABNORMAL: &str = include_str!("../../tests/scripts/abnormal.wat");
const NO_HANDLER: &str = include_str!("../../tests/scripts/no_handler.wat");
const ANNOUNCE: &str = include_str!("../../tests/scripts/announce.wat");
const FANOUT: &str = include_str!("../../tests/scripts/fanout.wat");
const SLOW_START: &str = include_str!("../../tests/scripts/slow_start.wat");
const ESCAPE: &str = include_str!("../../tests/scripts/escape.wat");
const HUNGRY: &str = include_str!("../../tests/scripts/hungry.wat");

fn test_config() -> SandboxConfig {
    SandboxConfig {
        load_timeout: Duration::from_millis(200),
        run_timeout: Duration::from_millis(100),
        ..SandboxConfig::default()
    }
}

fn engine() -> SandboxEngine {
    SandboxEngine::new(test_config()).unwrap()
}

fn inline(text: &str) -> ScriptSource {
    ScriptSource::Inline(text.to_string())
}

fn inbound(topic: &str, payload: &'static [u8]) -> InboundMessage {
    InboundMessage::new("local", topic, Bytes::from_static(payload))
}

#[test]
fn test_deadline_ticks_round_up() {
    assert_eq!(deadline_ticks(Duration::from_millis(1)), 2);
    assert_eq!(deadline_ticks(Duration::from_millis(10)), 2);
    assert_eq!(deadline_ticks(Duration::from_millis(15)), 3);
    assert_eq!(deadline_ticks(Duration::from_secs(2)), 201);
}

#[test]
fn test_identity_source_needs_no_module() {
    let engine = engine();
    let mut transform = engine.load_blocking("plain", &ScriptSource::Identity).unwrap();
    assert!(transform.is_identity());

    let out = transform.run(&inbound("a/b", b"x")).unwrap();
    assert_eq!(out, vec![OutboundMessage::new("a/b", Bytes::from_static(b"x"))]);
}

#[test]
fn test_script_republishes_message() {
    let engine = engine();
    let mut transform = engine.load_blocking("echo", &inline(IDENTITY)).unwrap();

    let out = transform.run(&inbound("sensors/1/temp", b"21.5")).unwrap();
    assert_eq!(
        out,
        vec![OutboundMessage::new("sensors/1/temp", Bytes::from_static(b"21.5"))]
    );
}

#[test]
fn test_state_persists_between_runs() {
    let engine = engine();
    let mut transform = engine.load_blocking("counter", &inline(COUNTER)).unwrap();

    for expected in 1..=3i32 {
        let out = transform.run(&inbound("any", b"")).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].topic, "count");
        assert_eq!(out[0].payload.as_ref(), expected.to_le_bytes());
    }
}

#[test]
fn test_contexts_do_not_share_state() {
    let engine = engine();
    let mut first = engine.load_blocking("first", &inline(COUNTER)).unwrap();
    let mut second = engine.load_blocking("second", &inline(COUNTER)).unwrap();

    first.run(&inbound("any", b"")).unwrap();
    first.run(&inbound("any", b"")).unwrap();
    let out = second.run(&inbound("any", b"")).unwrap();
    assert_eq!(out[0].payload.as_ref(), 1i32.to_le_bytes());
}

#[test]
fn test_run_timeout_is_enforced() {
    let engine = engine();
    let mut transform = engine.load_blocking("spin", &inline(SPIN)).unwrap();

    let started = Instant::now();
    let err = transform.run(&inbound("any", b"")).unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert!(started.elapsed() < Duration::from_secs(5));

    // The context stays usable after an interrupt
    let err = transform.run(&inbound("any", b"")).unwrap_err();
    assert!(err.is_timeout());
}

#[test]
fn test_trap_is_runtime_error() {
    let engine = engine();
    let mut transform = engine.load_blocking("trap", &inline(TRAP)).unwrap();
    let err = transform.run(&inbound("any", b"")).unwrap_err();
    assert!(matches!(err, ScriptRuntimeError::Trap(_)));
}

#[test]
fn test_negative_status_is_abnormal() {
    let engine = engine();
    let mut transform = engine.load_blocking("abnormal", &inline(ABNORMAL)).unwrap();
    let err = transform.run(&inbound("any", b"")).unwrap_err();
    assert!(matches!(err, ScriptRuntimeError::AbnormalStatus(-1)));
}

#[test]
fn test_missing_handler_fails_load() {
    let engine = engine();
    let err = engine.load_blocking("none", &inline(NO_HANDLER)).unwrap_err();
    assert!(matches!(err, ScriptLoadError::MissingExport("handler")));
}

#[test]
fn test_compile_error_fails_load() {
    let engine = engine();
    let err = engine.load_blocking("broken", &inline("(module (func")).unwrap_err();
    assert!(matches!(err, ScriptLoadError::Compile(_)));
}

#[test]
fn test_missing_file_fails_load() {
    let engine = engine();
    let err = engine
        .load_blocking(
            "gone",
            &ScriptSource::File("/nonexistent/relay/script.wat".into()),
        )
        .unwrap_err();
    assert!(matches!(err, ScriptLoadError::Read { .. }));
}

#[test]
fn test_load_timeout_is_enforced() {
    let engine = engine();
    let err = engine.load_blocking("slow", &inline(SLOW_START)).unwrap_err();
    assert!(matches!(err, ScriptLoadError::Timeout));
}

#[test]
fn test_unknown_import_is_refused() {
    let engine = engine();
    let err = engine.load_blocking("escape", &inline(ESCAPE)).unwrap_err();
    assert!(matches!(err, ScriptLoadError::Instantiate(_)));
}

#[test]
fn test_memory_limit_traps_growth() {
    let engine = engine();
    let mut transform = engine.load_blocking("hungry", &inline(HUNGRY)).unwrap();
    let err = transform.run(&inbound("any", b"")).unwrap_err();
    assert!(matches!(err, ScriptRuntimeError::Trap(_)));
}

#[test]
fn test_load_time_publish_goes_out_with_first_message() {
    let engine = engine();
    let mut transform = engine.load_blocking("announce", &inline(ANNOUNCE)).unwrap();

    if let Transform::Script(context) = &transform {
        assert_eq!(context.pending_outbound(), 1);
    } else {
        panic!("expected a script transform");
    }

    let first = transform.run(&inbound("any", b"")).unwrap();
    assert_eq!(first, vec![OutboundMessage::new("boot", Bytes::from_static(b"up"))]);
    let second = transform.run(&inbound("any", b"")).unwrap();
    assert!(second.is_empty());
}

#[test]
fn test_outbound_queue_overflow() {
    let engine = SandboxEngine::new(SandboxConfig {
        max_outbound: 1,
        ..test_config()
    })
    .unwrap();
    let mut transform = engine.load_blocking("fanout", &inline(FANOUT)).unwrap();

    let err = transform.run(&inbound("a", b"1")).unwrap_err();
    assert!(matches!(err, ScriptRuntimeError::QueueOverflow(1)));

    // Queue is drained after the failure
    if let Transform::Script(context) = &transform {
        assert_eq!(context.pending_outbound(), 0);
    }
}

#[tokio::test]
async fn test_async_load_and_run() {
    let engine = Arc::new(engine());
    assert!(engine.ticker_running());

    let transform = engine.load("echo", &inline(IDENTITY)).await.unwrap();
    let (transform, result) = SandboxEngine::run(transform, inbound("t", b"p")).await;
    assert!(transform.is_some());
    assert_eq!(result.unwrap().len(), 1);
}
