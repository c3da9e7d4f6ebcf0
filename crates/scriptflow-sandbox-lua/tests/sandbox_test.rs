use std::time::{Duration, Instant};

use scriptflow_host_http::HttpPolicy;
use scriptflow_host_log::LogPolicy;
use scriptflow_sandbox::{
  ExecutionOutcome, FailureKind, ResolvedSecrets, SandboxLimits, ScriptExecutor, ScriptRequest,
  TIMEOUT_MESSAGE,
};
use scriptflow_sandbox_lua::LuaSandbox;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sandbox_with_deadline(deadline_ms: u64) -> LuaSandbox {
  LuaSandbox::new(
    SandboxLimits {
      deadline: Duration::from_millis(deadline_ms),
      ..SandboxLimits::default()
    },
    HttpPolicy::default(),
    LogPolicy::default(),
  )
}

fn request(source: &str, payload: serde_json::Value) -> ScriptRequest {
  let mut secrets = ResolvedSecrets::new();
  secrets.insert("SECRET_KEY", "abc");
  ScriptRequest {
    invocation_id: "inv-test".to_string(),
    flow_id: "flow-test".to_string(),
    source: source.to_string(),
    payload,
    secrets: secrets.with_flow_id("flow-test"),
  }
}

async fn run(source: &str, payload: serde_json::Value) -> ExecutionOutcome {
  LuaSandbox::default().execute(request(source, payload)).await
}

fn assert_failure(outcome: &ExecutionOutcome, kind: FailureKind, needle: &str) {
  assert_eq!(outcome.failure_kind(), Some(kind), "outcome: {:?}", outcome);
  let message = outcome.error_message().unwrap_or_default();
  assert!(
    message.contains(needle),
    "expected {:?} in {:?}",
    needle,
    message
  );
}

#[tokio::test]
async fn test_payload_and_secret_are_combined() {
  let outcome = run(
    "return tostring(payload.value) .. env.SECRET_KEY",
    json!({"value": 10}),
  )
  .await;
  assert_eq!(outcome, ExecutionOutcome::success(json!("10abc")));
}

#[tokio::test]
async fn test_flow_id_is_visible_in_env() {
  let outcome = run("return env.FLOW_ID", json!({})).await;
  assert_eq!(outcome, ExecutionOutcome::success(json!("flow-test")));
}

#[tokio::test]
async fn test_no_return_is_null() {
  let outcome = run("local x = 1", json!({})).await;
  assert_eq!(outcome, ExecutionOutcome::success(serde_json::Value::Null));
}

#[tokio::test]
async fn test_tables_convert_to_json() {
  let outcome = run(
    r#"return { total = payload.a + payload.b, tags = { "x", "y" }, empty = {} }"#,
    json!({"a": 2, "b": 3.5}),
  )
  .await;
  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!({"total": 5.5, "tags": ["x", "y"], "empty": {}}))
  );
}

#[tokio::test]
async fn test_payload_returns_unchanged() {
  let payload = json!({"user": {"name": "ada", "roles": ["admin", "dev"]}, "count": 3});
  let outcome = run("return payload", payload.clone()).await;
  assert_eq!(outcome, ExecutionOutcome::success(payload));
}

#[tokio::test]
async fn test_payload_is_iterable_and_has_length() {
  let outcome = run(
    r#"
      local keys = 0
      for _ in pairs(payload) do keys = keys + 1 end
      local sum = 0
      for _, n in ipairs(payload.items) do sum = sum + n end
      return { keys = keys, len = #payload.items, sum = sum }
    "#,
    json!({"items": [1, 2, 3], "name": "x"}),
  )
  .await;
  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!({"keys": 2, "len": 3, "sum": 6}))
  );
}

#[tokio::test]
async fn test_payload_is_read_only() {
  let outcome = run("payload.value = 11 return payload.value", json!({"value": 10})).await;
  assert_failure(&outcome, FailureKind::ScriptError, "read-only");

  let outcome = run(
    "payload.nested.deep = true return 1",
    json!({"nested": {"deep": false}}),
  )
  .await;
  assert_failure(&outcome, FailureKind::ScriptError, "read-only");

  let outcome = run("return getmetatable(payload)", json!({})).await;
  assert_eq!(outcome, ExecutionOutcome::success(json!("read-only")));

  let outcome = run(
    r#"rawset(payload, "value", 99) return payload.value"#,
    json!({"value": 10}),
  )
  .await;
  assert_failure(&outcome, FailureKind::ScriptError, "read-only");

  let outcome = run(
    r#"
      local _, state = pairs(payload)
      local ok = pcall(function() state.value = 99 end)
      return { ok, payload.value }
    "#,
    json!({"value": 10}),
  )
  .await;
  assert_eq!(outcome, ExecutionOutcome::success(json!([false, 10])));
}

#[tokio::test]
async fn test_rawset_works_on_script_tables() {
  let outcome = run(r#"local t = {} rawset(t, "a", 1) return t.a"#, json!({})).await;
  assert_eq!(outcome, ExecutionOutcome::success(json!(1)));
}

#[tokio::test]
async fn test_env_mutation_stays_local() {
  let sandbox = LuaSandbox::default();
  let first = sandbox
    .execute(request(
      r#"env.SECRET_KEY = "changed" env.EXTRA = "1" return env.SECRET_KEY"#,
      json!({}),
    ))
    .await;
  assert_eq!(first, ExecutionOutcome::success(json!("changed")));

  let second = sandbox
    .execute(request("return { env.SECRET_KEY, env.EXTRA }", json!({})))
    .await;
  assert_eq!(second, ExecutionOutcome::success(json!(["abc"])));
}

#[tokio::test]
async fn test_globals_do_not_leak_between_runs() {
  let sandbox = LuaSandbox::default();
  let first = sandbox
    .execute(request(
      r#"leaked = "x" string.upper = nil return true"#,
      json!({}),
    ))
    .await;
  assert!(first.is_success());

  let second = sandbox
    .execute(request(r#"return { leaked == nil, string.upper("a") }"#, json!({})))
    .await;
  assert_eq!(second, ExecutionOutcome::success(json!([true, "A"])));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_runs_see_only_their_own_secrets() {
  let sandbox = LuaSandbox::default();

  let mut first = request("sleep(50) return { env.ONLY_A, env.ONLY_B }", json!({}));
  first.secrets.insert("ONLY_A", "a");
  let mut second = request("sleep(50) return { env.ONLY_A, env.ONLY_B }", json!({}));
  second.secrets.insert("ONLY_B", "b");

  let (a, b) = tokio::join!(sandbox.execute(first), sandbox.execute(second));
  assert_eq!(a, ExecutionOutcome::success(json!(["a"])));
  assert_eq!(b, ExecutionOutcome::success(json!({"2": "b"})));
}

#[tokio::test]
async fn test_cpu_loop_times_out() {
  let started = Instant::now();
  let outcome = sandbox_with_deadline(200)
    .execute(request("while true do end", json!({})))
    .await;
  assert_eq!(outcome, ExecutionOutcome::timeout());
  assert_eq!(outcome.error_message(), Some(TIMEOUT_MESSAGE));
  assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_pending_sleep_times_out() {
  let started = Instant::now();
  let outcome = sandbox_with_deadline(200)
    .execute(request("sleep(10000) return 1", json!({})))
    .await;
  assert_eq!(outcome, ExecutionOutcome::timeout());
  assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_pcall_cannot_swallow_the_deadline() {
  let outcome = sandbox_with_deadline(200)
    .execute(request(
      r#"
        while true do
          pcall(function() while true do end end)
          xpcall(function() while true do end end, function(e) return e end)
        end
      "#,
      json!({}),
    ))
    .await;
  assert_eq!(outcome, ExecutionOutcome::timeout());
}

#[tokio::test]
async fn test_pcall_still_catches_ordinary_errors() {
  let outcome = run(
    r#"
      local ok, err = pcall(error, "boom", 0)
      local ok2, handled = xpcall(function() error("bad") end, function(e) return "handled" end)
      return { ok, err, ok2, handled }
    "#,
    json!({}),
  )
  .await;
  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!([false, "boom", false, "handled"]))
  );
}

#[tokio::test]
async fn test_caught_host_errors_are_plain_messages() {
  let outcome = run(
    r#"
      local ok, err = pcall(json.decode, "{")
      local ok2, handled = xpcall(json.decode, function(e) return e end, "{")
      return {
        ok, type(err), err:find("stack traceback", 1, true) == nil,
        ok2, type(handled), handled:find("stack traceback", 1, true) == nil,
      }
    "#,
    json!({}),
  )
  .await;
  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!([false, "string", true, false, "string", true]))
  );
}

#[tokio::test]
async fn test_syntax_error() {
  let outcome = run("return (", json!({})).await;
  assert_failure(&outcome, FailureKind::ScriptError, "SyntaxError");
}

#[tokio::test]
async fn test_runtime_error() {
  let outcome = run(r#"error("boom")"#, json!({})).await;
  assert_failure(&outcome, FailureKind::ScriptError, "boom");
  assert!(!outcome.error_message().unwrap_or_default().contains("stack traceback"));
}

#[tokio::test]
async fn test_non_string_error_is_stringified() {
  let outcome = run("error({ code = 42 })", json!({})).await;
  assert_eq!(outcome.failure_kind(), Some(FailureKind::ScriptError));
  assert!(!outcome.error_message().unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_classification_is_stable() {
  let sandbox = LuaSandbox::default();
  let first = sandbox.execute(request("local t = nil return t.x", json!({}))).await;
  let second = sandbox.execute(request("local t = nil return t.x", json!({}))).await;
  assert_eq!(first, second);
  assert_eq!(first.failure_kind(), Some(FailureKind::ScriptError));
}

#[tokio::test]
async fn test_denied_globals_are_security_violations() {
  let cases = [
    (r#"os.execute("ls")"#, "os"),
    (r#"local fs = require("fs")"#, "require"),
    (r#"return io.open("/etc/passwd")"#, "io"),
    (r#"return load("return 1")()"#, "load"),
    ("return process.env", "process"),
    ("return debug.getinfo(1)", "debug"),
  ];

  for (source, name) in cases {
    let outcome = run(source, json!({})).await;
    assert_failure(
      &outcome,
      FailureKind::SecurityViolation,
      &format!("Access denied to {name}"),
    );
  }
}

#[tokio::test]
async fn test_caught_denial_is_still_a_security_violation() {
  let outcome = run(
    "local ok = pcall(function() return os end) return ok",
    json!({}),
  )
  .await;
  assert_failure(&outcome, FailureKind::SecurityViolation, "Access denied to os");

  let outcome = run(
    r#"
      local ok = xpcall(function() return io end, function() return "handled" end)
      return "recovered"
    "#,
    json!({}),
  )
  .await;
  assert_failure(&outcome, FailureKind::SecurityViolation, "Access denied to io");

  let outcome = run(
    r#"
      for _ = 1, 3 do pcall(function() return require end) end
      return "done"
    "#,
    json!({}),
  )
  .await;
  assert_failure(&outcome, FailureKind::SecurityViolation, "Access denied to require");
}

#[tokio::test]
async fn test_undeclared_globals_are_nil() {
  let outcome = run("return { missing == nil, coroutine == nil }", json!({})).await;
  assert_eq!(outcome, ExecutionOutcome::success(json!([true, true])));
}

#[tokio::test]
async fn test_bytecode_helpers_are_unavailable() {
  let outcome = run("return string.dump == nil", json!({})).await;
  assert_eq!(outcome, ExecutionOutcome::success(json!(true)));

  let outcome = run("\x1bLua\x54\x00", json!({})).await;
  assert_eq!(outcome.failure_kind(), Some(FailureKind::ScriptError));
}

#[tokio::test]
async fn test_memory_limit() {
  let sandbox = LuaSandbox::new(
    SandboxLimits {
      memory_limit_bytes: 4 * 1024 * 1024,
      ..SandboxLimits::default()
    },
    HttpPolicy::default(),
    LogPolicy::default(),
  );
  let outcome = sandbox
    .execute(request(
      r#"
        local t = {}
        for i = 1, 10000000 do t[i] = string.rep("x", 1024) .. i end
        return #t
      "#,
      json!({}),
    ))
    .await;
  assert_eq!(outcome.failure_kind(), Some(FailureKind::ScriptError));
  let message = outcome.error_message().unwrap_or_default().to_lowercase();
  assert!(message.contains("memory"), "message: {message}");
}

#[tokio::test]
async fn test_unconvertible_return_value() {
  let outcome = run("return function() end", json!({})).await;
  assert_failure(&outcome, FailureKind::ScriptError, "invalid return value");

  let outcome = run("local t = {} t.self = t return t", json!({})).await;
  assert_failure(&outcome, FailureKind::ScriptError, "nesting");
}

#[tokio::test]
async fn test_json_helpers() {
  let outcome = run(
    r#"
      local decoded = json.decode('{"a":[1,2],"b":"c"}')
      decoded.b = "changed"
      return { encoded = json.encode({ n = 1 }), a2 = decoded.a[2], b = decoded.b }
    "#,
    json!({}),
  )
  .await;
  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!({"encoded": "{\"n\":1}", "a2": 2, "b": "changed"}))
  );

  let outcome = run("return json.decode('{not json')", json!({})).await;
  assert_eq!(outcome.failure_kind(), Some(FailureKind::ScriptError));
}

#[tokio::test]
async fn test_logging_functions_are_available() {
  let outcome = run(
    r#"
      print("hello", 1, true)
      log.info("info")
      log.warn({ a = 1 })
      log.error("error")
      return "logged"
    "#,
    json!({}),
  )
  .await;
  assert_eq!(outcome, ExecutionOutcome::success(json!("logged")));
}

#[tokio::test]
async fn test_http_get_and_post() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .and(path("/status"))
    .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": 42})))
    .mount(&server)
    .await;
  Mock::given(method("POST"))
    .and(path("/echo"))
    .respond_with(ResponseTemplate::new(201).set_body_string("created"))
    .mount(&server)
    .await;

  let source = format!(
    r#"
      local got = http.get("{base}/status")
      local posted = http.post("{base}/echo", {{ id = payload.id }}, {{ headers = {{ ["x-flow"] = env.FLOW_ID }} }})
      return {{ value = got.json.value, ok = got.ok, status = posted.status, body = posted.body }}
    "#,
    base = server.uri()
  );
  let outcome = run(&source, json!({"id": 7})).await;
  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!({"value": 42, "ok": true, "status": 201, "body": "created"}))
  );
}

#[tokio::test]
async fn test_http_error_status_is_script_error_and_catchable() {
  let server = MockServer::start().await;
  Mock::given(method("GET"))
    .respond_with(ResponseTemplate::new(500))
    .mount(&server)
    .await;

  let outcome = run(&format!(r#"return http.get("{}/x")"#, server.uri()), json!({})).await;
  assert_failure(&outcome, FailureKind::ScriptError, "500");

  let source = format!(
    r#"
      local ok, err = pcall(http.get, "{base}/x")
      local raw = http.get("{base}/x", {{ raise_for_status = false }})
      return {{ ok, err, raw.status, raw.ok }}
    "#,
    base = server.uri()
  );
  let outcome = run(&source, json!({})).await;
  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!([false, "request failed with status 500", 500, false]))
  );
}

#[tokio::test]
async fn test_http_policy_violations() {
  let outcome = run(r#"return http.get("file:///etc/passwd")"#, json!({})).await;
  assert_failure(&outcome, FailureKind::SecurityViolation, "Access denied");

  let outcome = run(
    r#"return http.get("http://169.254.169.254/latest/meta-data")"#,
    json!({}),
  )
  .await;
  assert_eq!(outcome.failure_kind(), Some(FailureKind::SecurityViolation));

  let outcome = run(
    r#"
      local ok = pcall(http.get, "http://[::ffff:a9fe:a9fe]/latest/meta-data")
      return "swallowed"
    "#,
    json!({}),
  )
  .await;
  assert_failure(&outcome, FailureKind::SecurityViolation, "Access denied");
}

#[tokio::test]
async fn test_string_patterns() {
  let outcome = run(
    r#"
      local words = {}
      for w in ("one two three"):gmatch("%a+") do words[#words + 1] = w end
      local s1, e1 = string.find("hello world", "o w")
      local s2, e2, k, v = string.find("key=val", "(%w+)=(%w+)")
      local p1, p2 = string.match("hello", "()ll()")
      return {
        find = { s1, e1 },
        captures = { s2, e2, k, v },
        plain = { ("a.b"):find(".", 1, true) },
        trim = string.match("  trim me  ", "^%s*(.-)%s*$"),
        date = { string.match("2024-01-15", "(%d+)-(%d+)-(%d+)") },
        positions = { p1, p2 },
        balanced = string.match("f(a(b)c) x", "%b()"),
        frontier = (string.gsub("THE (quick) fox", "%f[%a]%a+", "W")),
        words = words,
        doubled = (string.gsub("abc", "%w", "%0%0")),
        vars = (string.gsub("$name is $age", "%$(%w+)", { name = "bob", age = 3 })),
        upper = (string.gsub("abc", "b", function(c) return c:upper() end)),
        count = select(2, string.gsub("hello world", "o", "0")),
        empty = (string.gsub("abc", "", "-")),
        anchored = (string.gsub("aaa", "^a", "b")),
        missing = string.find("abc", "z") == nil,
      }
    "#,
    json!({}),
  )
  .await;

  assert_eq!(
    outcome,
    ExecutionOutcome::success(json!({
      "find": [5, 7],
      "captures": [1, 7, "key", "val"],
      "plain": [2, 2],
      "trim": "trim me",
      "date": ["2024", "01", "15"],
      "positions": [3, 5],
      "balanced": "(a(b)c)",
      "frontier": "W (W) W",
      "words": ["one", "two", "three"],
      "doubled": "aabbcc",
      "vars": "bob is 3",
      "upper": "aBc",
      "count": 2,
      "empty": "-a-b-c-",
      "anchored": "baa",
      "missing": true,
    }))
  );
}

#[tokio::test]
async fn test_malformed_pattern_is_script_error() {
  let outcome = run(r#"return string.find("abc", "[a")"#, json!({})).await;
  assert_failure(&outcome, FailureKind::ScriptError, "missing ']'");
}

#[tokio::test]
async fn test_backtracking_pattern_stops_at_the_deadline() {
  let sandbox = LuaSandbox::new(
    SandboxLimits {
      deadline: Duration::from_millis(300),
      max_workers: 1,
      ..SandboxLimits::default()
    },
    HttpPolicy::default(),
    LogPolicy::default(),
  );
  let source = r#"
    local s = string.rep("a", 40)
    local p = string.rep("a?", 40) .. string.rep("a", 40) .. "b"
    return s:find(p)
  "#;

  let started = Instant::now();
  let outcome = sandbox.execute(request(source, json!({}))).await;
  assert_eq!(outcome, ExecutionOutcome::timeout());
  assert!(started.elapsed() < Duration::from_secs(2));

  // The only worker slot is free again, so the worker really stopped.
  let outcome = sandbox.execute(request("return 1", json!({}))).await;
  assert_eq!(outcome, ExecutionOutcome::success(json!(1)));
}
