//! End-to-end tests against a scripted host.
//!
//! The host runs on a plain thread at the far end of a `MemoryTransport` pair
//! (or a real loopback socket). It records every frame the client writes and
//! answers calls by method name:
//!
//! - `echo` returns its first argument
//! - `fail` / `gone` return an error (`gone` with `ENTITY_GONE`)
//! - `getEntity` returns a fresh handle-bound proxy
//! - `getWorld` returns handle 42 every time
//! - `getUniqueId` returns Steve's UUID
//! - `getOnlinePlayers` lists two handle-bound players
//! - `hang` never answers

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use hostlink::Bridge;
use hostlink::BridgeConfig;
use hostlink::Error;
use hostlink::Event;
use hostlink::Outcome;
use hostlink::SubscribeOptions;
use hostlink::logging;
use hostlink::mock_transport::MemoryTransport;
use hostlink::transport::Transport;
use hostwire::CallMessage;
use hostwire::Message;
use hostwire::Priority;
use hostwire::Proxy;
use hostwire::ResultKind;
use hostwire::Value;
use hostwire::frame;
use hostwire::message::ATOMIC_ABORT;
use hostwire::message::ENTITY_GONE;
use serde_json::Value as Json;
use serde_json::json;
use uuid::Uuid;

// ============================================================================
//  SCRIPTED HOST
// ============================================================================

struct FakeHost {
    transport: Arc<MemoryTransport>,
    seen: Arc<Mutex<Vec<Message>>>,
    ended: Arc<AtomicBool>,
}

impl FakeHost {
    fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.seen().iter().filter(|m| m.kind() == kind).count()
    }

    fn push(&self, message: Message) {
        self.transport.send(&message.to_bytes().unwrap()).unwrap();
    }

    fn push_raw(&self, payload: &[u8]) {
        self.transport.send(payload).unwrap();
    }

    /// True once the host's reader saw end-of-stream.
    fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Hangs up. The client's reader sees end-of-stream.
    fn hang_up(&self) {
        self.transport.close();
    }
}

const STEVE_UUID: &str = "069a79f4-44e9-4726-a5be-fca90e38aaf5";
const ALEX_UUID: &str = "853c80ef-3c37-49fd-aa49-938b674adae6";

fn reply_to(call: &CallMessage) -> Option<Message> {
    // reference calls carry the real method name third: [kind, id, method, args]
    let method = match (call.method.as_str(), call.target.as_deref()) {
        ("call", Some("ref")) => call.args_list.get(2).and_then(Json::as_str).unwrap_or_default(),
        (method, _) => method,
    };
    match method {
        "echo" => Some(Message::Return {
            id: call.id,
            result: call.args_list.first().cloned().unwrap_or(Json::Null),
        }),
        "getEntity" => Some(Message::Return {
            id: call.id,
            result: json!({"__handle__": call.id, "__type__": "Zombie", "fields": {"health": 20.0}}),
        }),
        "getWorld" => Some(Message::Return {
            id: call.id,
            result: json!({"__handle__": 42, "__type__": "World", "fields": {"name": "world"}}),
        }),
        "getUniqueId" => Some(Message::Return { id: call.id, result: json!({"__uuid__": STEVE_UUID}) }),
        "getOnlinePlayers" => Some(Message::Return {
            id: call.id,
            result: json!([
                {"__handle__": 500, "__type__": "Player", "fields": {"name": "Steve", "uuid": STEVE_UUID}},
                {"__handle__": 501, "__type__": "Player", "fields": {"name": "Alex", "uuid": ALEX_UUID}},
            ]),
        }),
        "fail" => Some(Message::Error { id: Some(call.id), message: Some("boom".into()), code: None }),
        "gone" => Some(Message::Error {
            id: Some(call.id),
            message: Some("entity no longer exists".into()),
            code: Some(ENTITY_GONE.into()),
        }),
        "hang" => None,
        _ => Some(Message::Return { id: call.id, result: Json::Null }),
    }
}

fn respond(message: &Message) -> Vec<Message> {
    match message {
        Message::Call(call) => reply_to(call).into_iter().collect(),
        Message::CallBatch { atomic, messages } => {
            let mut replies = Vec::new();
            let mut aborted = false;
            for call in messages {
                if aborted {
                    replies.push(Message::Error {
                        id: Some(call.id),
                        message: Some("earlier call failed".into()),
                        code: Some(ATOMIC_ABORT.into()),
                    });
                    continue;
                }
                let reply = reply_to(call);
                if *atomic && matches!(reply, Some(Message::Error { .. })) {
                    aborted = true;
                }
                replies.extend(reply);
            }
            replies
        }
        Message::Wait { id, .. } => vec![Message::Return { id: *id, result: Json::Null }],
        _ => Vec::new(),
    }
}

fn start() -> (Bridge, FakeHost) {
    start_with(respond)
}

/// Starts a host that answers each frame with whatever `respond` returns.
fn start_with(mut respond: impl FnMut(&Message) -> Vec<Message> + Send + 'static) -> (Bridge, FakeHost) {
    logging::init();
    let (client, host) = MemoryTransport::pair();
    let transport = Arc::new(host);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let ended = Arc::new(AtomicBool::new(false));

    let (reader, log, done) = (transport.clone(), seen.clone(), ended.clone());
    thread::spawn(move || {
        while let Ok(Some(payload)) = reader.recv() {
            let Ok(message) = Message::from_bytes(&payload) else {
                continue;
            };
            let replies = respond(&message);
            log.lock().unwrap().push(message);
            for reply in replies {
                if reader.send(&reply.to_bytes().unwrap()).is_err() {
                    break;
                }
            }
        }
        done.store(true, Ordering::SeqCst);
    });

    let bridge = Bridge::with_transport(client, "test-token").unwrap();
    (bridge, FakeHost { transport, seen, ended })
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn event_frame(event: &str, payload: Json) -> Message {
    Message::Event { event: event.into(), payload }
}

// ============================================================================
//  1. CALLS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auth_then_echo() {
    let (bridge, host) = start();
    let reply = bridge.server().call("echo", vec![Value::from("pong")]).await.unwrap();
    assert_eq!(reply, Value::from("pong"));

    let seen = host.seen();
    assert_eq!(seen[0], Message::Auth { token: "test-token".into() });
    match &seen[1] {
        Message::Call(call) => {
            assert_eq!(call.method, "echo");
            assert_eq!(call.target.as_deref(), Some("server"));
        }
        other => panic!("expected call, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_async_and_blocking_calls() {
    let (bridge, _host) = start();

    let mut blocking = Vec::new();
    for i in 1000..1010 {
        let bridge = bridge.clone();
        blocking.push(tokio::task::spawn_blocking(move || {
            (i, bridge.server().call_blocking("echo", vec![Value::Int(i)]))
        }));
    }
    let pending: Vec<_> = (0..50).map(|i| (i, bridge.server().call("echo", vec![Value::Int(i)]))).collect();

    for (i, future) in pending {
        assert_eq!(future.await.unwrap(), Value::Int(i));
    }
    for task in blocking {
        let (i, result) = task.await.unwrap();
        assert_eq!(result.unwrap(), Value::Int(i));
    }
    assert_eq!(bridge.outstanding_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_replies_in_reverse_order_reach_their_callers() {
    const CALLS: usize = 20;
    let mut held = Vec::new();
    let (bridge, _host) = start_with(move |message| {
        held.extend(respond(message));
        if held.len() < CALLS {
            return Vec::new();
        }
        held.drain(..).rev().collect()
    });

    let mut blocking = Vec::new();
    for i in 100..106 {
        let bridge = bridge.clone();
        blocking.push(tokio::task::spawn_blocking(move || {
            (i, bridge.server().call_blocking("echo", vec![Value::Int(i)]))
        }));
    }
    let pending: Vec<_> = (0..14).map(|i| (i, bridge.server().call("echo", vec![Value::Int(i)]))).collect();

    for (i, future) in pending {
        assert_eq!(future.await.unwrap(), Value::Int(i));
    }
    for task in blocking {
        let (i, result) = task.await.unwrap();
        assert_eq!(result.unwrap(), Value::Int(i));
    }
    assert_eq!(bridge.outstanding_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_errors() {
    let (bridge, _host) = start();

    match bridge.server().call("fail", Vec::new()).await {
        Err(Error::Remote(remote)) => assert_eq!(remote.message, "boom"),
        other => panic!("expected remote error, got {other:?}"),
    }

    let zombie = Proxy::entity(Uuid::new_v4());
    let gone = bridge.call(&zombie, "gone", Vec::new()).await.unwrap_err();
    assert!(matches!(gone, Error::EntityGone(_)));
    assert!(gone.is_remote());

    // the connection survives remote errors
    assert_eq!(bridge.server().call("echo", vec![Value::Int(1)]).await.unwrap(), Value::Int(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handle_proxy_fields_and_calls() {
    let (bridge, host) = start();
    let zombie = bridge.server().call("getEntity", Vec::new()).await.unwrap();
    let zombie = zombie.as_proxy().unwrap();

    assert_eq!(zombie.type_name(), "Zombie");
    assert_eq!(bridge.attr(zombie, "health").cached(), Some(&Value::Float(20.0)));

    bridge.set_attr(zombie, "customName", "Bob").await.unwrap();
    let handle = zombie.handle().unwrap();
    let write = host
        .seen()
        .into_iter()
        .find_map(|m| match m {
            Message::Call(call) if call.method == "set_attr" => Some(call),
            _ => None,
        })
        .unwrap();
    assert_eq!(write.handle, Some(handle));
    assert_eq!(write.field.as_deref(), Some("customName"));
    assert_eq!(write.value, Some(json!("Bob")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reference_proxy_needs_no_network_until_called() {
    let (bridge, host) = start();
    let world = Proxy::world("world_nether");
    let steve = bridge.player("Steve");

    assert_eq!(bridge.attr(&steve, "name").cached(), Some(&Value::from("Steve")));
    assert_eq!(world.reference().unwrap().kind, "world");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(host.seen().len(), 1);

    bridge.call(&world, "getTime", Vec::new()).await.unwrap();
    match host.seen().last().unwrap() {
        Message::Call(call) => {
            assert_eq!(call.method, "call");
            assert_eq!(call.target.as_deref(), Some("ref"));
            assert_eq!(call.args_list, vec![json!("world"), json!("world_nether"), json!("getTime"), json!([])]);
        }
        other => panic!("expected call, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_ignores_unknown_frames() {
    let (bridge, host) = start();
    host.push_raw(br#"{"type":"telemetry","tps":20.0}"#);
    bridge.wait(5).await.unwrap();
    assert!(!bridge.is_closed());
    assert!(host.seen().contains(&Message::Wait { id: 1, ticks: 5 }));
}

// ============================================================================
//  1b. PLAYERS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_player_uuid_asks_the_host_once() {
    let (bridge, host) = start();
    let resolver = bridge.clone();
    let (first, second, cached) = tokio::task::spawn_blocking(move || {
        let mut steve = Proxy::player("Steve");
        let first = resolver.player_uuid_blocking(&mut steve).unwrap();
        let second = resolver.player_uuid_blocking(&mut steve).unwrap();
        (first, second, steve.field("uuid").cloned())
    })
    .await
    .unwrap();

    assert_eq!(first.as_deref(), Some(STEVE_UUID));
    assert_eq!(second, first);
    assert_eq!(cached, Some(Value::from(STEVE_UUID)));
    assert_eq!(bridge.players().uuid_of("Steve").as_deref(), Some(STEVE_UUID));
    assert_eq!(host.count("call"), 1);

    // a fresh proxy for the same name now resolves from the directory
    let resolver = bridge.clone();
    let again = tokio::task::spawn_blocking(move || resolver.player_uuid_blocking(&mut Proxy::player("Steve")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.as_deref(), Some(STEVE_UUID));
    assert_eq!(host.count("call"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_player_uuid_from_reference_needs_no_call() {
    let (bridge, host) = start();
    let uuid = Uuid::new_v4();
    let resolver = bridge.clone();
    let resolved = tokio::task::spawn_blocking(move || {
        let mut player = Proxy::player(&uuid.to_string());
        player.fields_mut().clear();
        resolver.player_uuid_blocking(&mut player)
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(resolved, Some(uuid.to_string()));
    assert_eq!(host.count("call"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prime_players_fills_the_directory() {
    let (bridge, _host) = start();
    assert!(bridge.players().is_empty());

    assert_eq!(bridge.prime_players().await.unwrap(), 2);
    assert_eq!(bridge.players().uuid_of("Steve").as_deref(), Some(STEVE_UUID));
    assert_eq!(bridge.players().uuid_of("Alex").as_deref(), Some(ALEX_UUID));
    assert_eq!(bridge.player("Alex").field("uuid"), Some(&Value::from(ALEX_UUID)));
}

// ============================================================================
//  2. BATCHING
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frame_batch_is_one_write() {
    let (bridge, host) = start();
    let server = bridge.server();

    let scope = bridge.frame();
    let first = server.call("echo", vec![Value::Int(1)]);
    let failing = server.call("fail", Vec::new());
    let third = server.call("echo", vec![Value::Int(3)]);
    assert_eq!(bridge.buffered_calls(), 3);

    let result = scope.finish().await;
    assert!(result.unwrap_err().is_remote());

    assert_eq!(first.await.unwrap(), Value::Int(1));
    assert!(failing.await.is_err());
    assert_eq!(third.await.unwrap(), Value::Int(3));

    assert_eq!(host.count("call"), 0);
    let batches: Vec<_> = host
        .seen()
        .into_iter()
        .filter_map(|m| match m {
            Message::CallBatch { atomic, messages } => Some((atomic, messages.len())),
            _ => None,
        })
        .collect();
    assert_eq!(batches, vec![(false, 3)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_atomic_batch_stops_at_first_failure() {
    let (bridge, _host) = start();
    let server = bridge.server();

    let scope = bridge.atomic();
    let first = server.call("echo", vec![Value::Int(1)]);
    let failing = server.call("fail", Vec::new());
    let skipped = server.call("echo", vec![Value::Int(3)]);

    match scope.finish().await {
        Err(Error::Remote(remote)) => assert_eq!(remote.message, "boom"),
        other => panic!("expected the first failure, got {other:?}"),
    }
    assert_eq!(first.await.unwrap(), Value::Int(1));
    assert!(failing.await.is_err());
    let skipped = skipped.await.unwrap_err();
    assert_eq!(skipped.remote().unwrap().code.as_deref(), Some(ATOMIC_ABORT));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_atomic_scope_wins() {
    let (bridge, host) = start();

    let outer = bridge.frame();
    let inner = bridge.atomic();
    let call = bridge.server().call("echo", vec![Value::Int(7)]);
    inner.finish().await.unwrap();
    outer.finish().await.unwrap();

    assert_eq!(call.await.unwrap(), Value::Int(7));
    assert_eq!(host.count("call_batch"), 1);
    assert!(host.seen().iter().any(|m| matches!(m, Message::CallBatch { atomic: true, .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_calls_skip_the_batch() {
    let (bridge, host) = start();
    let scope = bridge.frame();

    let worker = bridge.clone();
    let value = tokio::task::spawn_blocking(move || worker.server().call_blocking("echo", vec![Value::Int(9)]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, Value::Int(9));
    assert_eq!(host.count("call"), 1);
    scope.finish().await.unwrap();
    assert_eq!(host.count("call_batch"), 0);
}

// ============================================================================
//  3. HANDLE RELEASE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sixty_four_releases_go_out_together() {
    let (bridge, host) = start();

    let mut entities = Vec::new();
    for _ in 0..64 {
        entities.push(bridge.server().call("getEntity", Vec::new()).await.unwrap());
    }
    let handles: Vec<i64> = entities.iter().map(|v| v.as_proxy().unwrap().handle().unwrap()).collect();
    drop(entities);

    assert_eq!(bridge.pending_releases(), 0);
    eventually("release frame", || host.count("release") == 1).await;
    let released = host
        .seen()
        .into_iter()
        .find_map(|m| match m {
            Message::Release { handles } => Some(handles),
            _ => None,
        })
        .unwrap();
    assert_eq!(released, handles);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_precedes_next_call() {
    let (bridge, host) = start();
    let entity = bridge.server().call("getEntity", Vec::new()).await.unwrap();
    let handle = entity.as_proxy().unwrap().handle().unwrap();

    // a clone keeps the handle alive
    let copy = entity.clone();
    drop(entity);
    assert_eq!(bridge.pending_releases(), 0);
    drop(copy);
    assert_eq!(bridge.pending_releases(), 1);

    bridge.server().call("echo", vec![Value::Int(0)]).await.unwrap();
    let kinds: Vec<_> = host.seen().iter().map(Message::kind).collect();
    assert_eq!(kinds, vec!["auth", "call", "release", "call"]);
    assert!(host.seen().contains(&Message::Release { handles: vec![handle] }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_same_handle_returned_twice_stays_alive() {
    let (bridge, host) = start();
    let server = bridge.server();
    let first = server.call("getWorld", Vec::new()).await.unwrap();
    let second = server.call("getWorld", Vec::new()).await.unwrap();

    drop(first);
    assert_eq!(bridge.pending_releases(), 0);

    let world = second.as_proxy().unwrap();
    assert_eq!(world.handle(), Some(42));
    bridge.call(world, "getName", Vec::new()).await.unwrap();
    assert_eq!(host.count("release"), 0);

    drop(second);
    assert_eq!(bridge.pending_releases(), 1);
}

// ============================================================================
//  4. EVENTS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_handlers_do_not_block_the_rest() {
    let (bridge, host) = start();
    let ran = Arc::new(AtomicUsize::new(0));

    let counter = ran.clone();
    bridge.on("player_chat", move |event: Event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let original = event.field("message").and_then(Value::as_str).unwrap_or_default().to_string();
            Ok::<_, anyhow::Error>(Outcome::Text(format!("[shout] {original}")))
        }
    });
    bridge.on("player_chat", |_event: Event| async move { Err::<Outcome, _>(anyhow::anyhow!("second handler broke")) });
    let counter = ran.clone();
    bridge.on("player_chat", move |event: Event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if event.name() == "player_chat" {
                panic!("third handler exploded");
            }
            Ok::<_, anyhow::Error>(Outcome::None)
        }
    });

    host.push(event_frame(
        "player_chat",
        json!({
            "event": {"__handle__": 900, "__type__": "AsyncPlayerChatEvent"},
            "id": 77,
            "message": "hi"
        }),
    ));

    eventually("event_done", || host.seen().contains(&Message::EventDone { id: 77 })).await;
    assert_eq!(ran.load(Ordering::SeqCst), 2);

    let answers: Vec<_> = host
        .seen()
        .into_iter()
        .filter(|m| matches!(m, Message::EventResult { .. } | Message::EventDone { .. }))
        .collect();
    assert_eq!(
        answers,
        vec![
            Message::EventResult { id: 77, result: json!("[shout] hi"), result_type: ResultKind::Chat },
            Message::EventDone { id: 77 },
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_damage_override() {
    let (bridge, host) = start();
    bridge.on("entity_damage", |event: Event| async move {
        let damage = event.field("damage").and_then(Value::as_f64).unwrap_or_default();
        Ok::<_, anyhow::Error>(Outcome::Number(damage / 2.0))
    });

    host.push(event_frame(
        "entity_damage",
        json!({"event": {"__handle__": 901, "__type__": "EntityDamageEvent"}, "id": 78, "damage": 5.0}),
    ));

    eventually("event_done", || host.seen().contains(&Message::EventDone { id: 78 })).await;
    assert!(host.seen().contains(&Message::EventResult {
        id: 78,
        result: json!(2.5),
        result_type: ResultKind::Damage,
    }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unhandled_event_is_not_acknowledged() {
    let (bridge, host) = start();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    bridge.on("player_join", move |_event: Event| {
        let tx = tx.clone();
        async move {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            Ok::<_, anyhow::Error>(Outcome::None)
        }
    });

    host.push(event_frame("block_break", json!({"event": {"__handle__": 5, "__type__": "BlockBreakEvent"}, "id": 5})));
    host.push(event_frame("player_join", json!({"event": {"__handle__": 6, "__type__": "PlayerJoinEvent"}, "id": 6})));
    rx.await.unwrap();

    eventually("event_done", || host.seen().contains(&Message::EventDone { id: 6 })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!host.seen().contains(&Message::EventDone { id: 5 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_batch_dispatches_each_payload() {
    let (bridge, host) = start();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    bridge.on("player_move", move |_event: Event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(Outcome::None)
        }
    });

    host.push(Message::EventBatch {
        event: "player_move".into(),
        payloads: vec![json!({"x": 1}), json!({"x": 2}), json!({"x": 3})],
    });
    eventually("three dispatches", || ticks.load(Ordering::SeqCst) == 3).await;
    assert_eq!(host.count("event_done"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_runs_handlers_then_acks() {
    let (bridge, host) = start();
    let cleaned = Arc::new(AtomicUsize::new(0));
    let counter = cleaned.clone();
    bridge.on("shutdown", move |_event: Event| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(Outcome::None)
        }
    });

    host.push(Message::Shutdown);
    eventually("shutdown_ack", || host.count("shutdown_ack") == 1).await;
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subscribe_command_and_ready_frames() {
    let (bridge, host) = start();
    bridge
        .listen(
            "player_join",
            SubscribeOptions::default().priority(Priority::High).throttle_ms(250),
            |_event: Event| async move { Ok::<_, anyhow::Error>(Outcome::None) },
        )
        .unwrap();
    bridge
        .command("Heal", Some("demo.heal"), |_event: Event| async move {
            Ok::<_, anyhow::Error>(Outcome::None)
        })
        .unwrap();
    bridge.ready().unwrap();

    eventually("ready", || host.count("ready") == 1).await;
    let seen = host.seen();
    assert!(seen.contains(&Message::Subscribe {
        event: "player_join".into(),
        once_per_tick: false,
        priority: Priority::High,
        throttle_ms: 250,
    }));
    assert!(seen.contains(&Message::RegisterCommand { name: "heal".into(), permission: Some("demo.heal".into()) }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeating_task_starts_on_boot() {
    let (bridge, host) = start();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    bridge.repeat(20, 0, move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
    });

    host.push(event_frame("server_boot", json!({})));
    eventually("three runs", || runs.load(Ordering::SeqCst) >= 3).await;
    assert!(host.seen().contains(&Message::Wait { id: 1, ticks: 20 }));
    bridge.close();
}

// ============================================================================
//  5. CONNECTION LOSS
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_loss_fails_every_pending_call() {
    let (bridge, host) = start();

    let pending: Vec<_> = (0..5).map(|_| bridge.server().call("hang", Vec::new())).collect();
    let mut blocked = Vec::new();
    for _ in 0..3 {
        let bridge = bridge.clone();
        blocked.push(tokio::task::spawn_blocking(move || bridge.server().call_blocking("hang", Vec::new())));
    }
    eventually("all calls sent", || host.count("call") == 8).await;

    host.hang_up();
    bridge.closed().await;
    assert!(bridge.is_closed());

    for future in pending {
        assert!(matches!(future.await, Err(Error::ConnectionLost(_))));
    }
    for task in blocked {
        assert!(matches!(task.await.unwrap(), Err(Error::ConnectionLost(_))));
    }
    assert_eq!(bridge.outstanding_calls(), 0);
    assert!(matches!(bridge.server().call("echo", Vec::new()).await, Err(Error::ConnectionLost(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undecodable_frame_closes_connection() {
    let (bridge, host) = start();
    let pending = bridge.server().call("hang", Vec::new());
    eventually("call sent", || host.count("call") == 1).await;

    host.push_raw(b"\x00not json");
    match pending.await {
        Err(Error::ConnectionLost(reason)) => assert!(reason.contains("Protocol"), "{reason}"),
        other => panic!("expected connection loss, got {other:?}"),
    }
    assert!(bridge.is_closed());
    // the client hangs up its end too
    eventually("host sees end-of-stream", || host.ended()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_client_close_hangs_up() {
    let (bridge, host) = start();
    bridge.server().call("echo", vec![Value::Int(1)]).await.unwrap();

    bridge.close();
    assert!(bridge.is_closed());
    eventually("host sees end-of-stream", || host.ended()).await;
    assert!(matches!(
        bridge.server().call("echo", Vec::new()).await,
        Err(Error::ConnectionLost(_))
    ));
}

// ============================================================================
//  6. TCP
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loopback_tcp_session() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let host = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader = stream.try_clone().unwrap();
        let mut seen = Vec::new();
        while let Ok(Some(payload)) = frame::read_frame(&mut reader) {
            let message = Message::from_bytes(&payload).unwrap();
            if let Message::Call(call) = &message {
                let result = match call.method.as_str() {
                    "getOnlinePlayers" => json!([
                        {"__handle__": 7, "__type__": "Player", "fields": {"name": "Steve", "uuid": STEVE_UUID}},
                    ]),
                    _ => call.args_list[0].clone(),
                };
                let reply = Message::Return { id: call.id, result };
                frame::write_frame(&mut stream, &reply.to_bytes().unwrap()).unwrap();
            }
            seen.push(message);
        }
        seen
    });

    let bridge = Bridge::connect(&BridgeConfig::new(port, "secret")).unwrap();
    let reply = bridge.server().call("echo", vec![Value::from("over tcp")]).await.unwrap();
    assert_eq!(reply, Value::from("over tcp"));

    bridge.close();
    bridge.closed().await;
    let seen = host.join().unwrap();
    // the primed player's handle may be released at any point after its reply
    let seen: Vec<_> = seen.into_iter().filter(|m| m.kind() != "release").collect();
    assert_eq!(seen[0], Message::Auth { token: "secret".into() });
    assert!(matches!(&seen[1], Message::Call(call) if call.method == "getOnlinePlayers"));
    assert_eq!(seen.len(), 3);
    assert_eq!(bridge.players().uuid_of("Steve").as_deref(), Some(STEVE_UUID));
}
