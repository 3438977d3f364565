//! Integration tests for coroutine execution on the event loop.
//!
//! These drive real scripts through the public `Instance` API and check the
//! output, completion and statistics they produce.

mod common;

use std::sync::Arc;

use common::{eventually, start_instance};
use lunet::{BufferSink, Completion, Request, RequestContext, ScriptError};

#[test]
fn test_say_flattens_arguments() {
    let (instance, out) = start_instance();
    let done = instance
        .run_string(r#"lunet.say("hello ", 1, " ", 2.0, {" ", "x", {"y"}}) lunet.print("!")"#)
        .expect("run");
    assert_eq!(done, Completion::default());
    assert_eq!(out.contents(), "hello 1 2 xy\n!");
}

#[test]
fn test_sleep_suspends_and_resumes() {
    let (instance, out) = start_instance();
    instance
        .run_string(
            r#"lunet.say("a") lunet.sleep(0.01) lunet.say("b") lunet.sleep(0) lunet.say("c")"#,
        )
        .expect("run");
    assert_eq!(out.contents(), "a\nb\nc\n");
}

#[test]
fn test_sleep_rejects_bad_arguments_without_yielding() {
    let (instance, out) = start_instance();
    instance
        .run_string(
            r#"
            local ok, err = lunet.sleep(-1)
            lunet.say(tostring(ok), " ", err)
            ok, err = lunet.sleep("soon")
            lunet.say(tostring(ok), " ", err)
            "#,
        )
        .expect("run");
    assert_eq!(
        out.contents(),
        "nil sleep argument must be non-negative\nnil sleep argument must be a number\n"
    );
}

#[test]
fn test_runtime_error_carries_traceback() {
    let (instance, _out) = start_instance();
    let err = instance
        .run_string("local x = 1\nerror('boom')")
        .expect_err("script raises");
    let ScriptError::Runtime(message) = err else {
        panic!("expected runtime error, got {err:?}");
    };
    assert!(message.contains("boom"), "{message}");
    assert!(message.contains("stack traceback"), "{message}");
}

#[test]
fn test_syntax_error_is_a_load_error() {
    let (instance, _out) = start_instance();
    let err = instance.run_string("return (").expect_err("does not compile");
    assert!(matches!(err, ScriptError::Load(_)), "{err:?}");
    // The instance keeps serving after a failed load.
    assert!(instance.run_string("return 1").is_ok());
}

#[test]
fn test_exit_terminates_with_code() {
    let (instance, out) = start_instance();
    let done = instance
        .run_string(r#"lunet.say("before") lunet.exit(3) lunet.say("after")"#)
        .expect("run");
    assert_eq!(done.exit_code, Some(3));
    assert_eq!(out.contents(), "before\n");
}

#[test]
fn test_exit_escapes_pcall_and_nested_coroutines() {
    let (instance, out) = start_instance();
    let done = instance
        .run_string(r#"pcall(function() lunet.exit(5) end) lunet.say("after pcall")"#)
        .expect("run");
    assert_eq!(done.exit_code, Some(5));

    let done = instance
        .run_string(
            r#"
            local inner = coroutine.wrap(function()
                lunet.sleep(0)
                lunet.exit(7)
            end)
            inner()
            lunet.say("after wrap")
            "#,
        )
        .expect("run");
    assert_eq!(done.exit_code, Some(7));
    assert_eq!(out.contents(), "");
}

#[test]
fn test_nested_coroutines_can_suspend() {
    let (instance, out) = start_instance();
    instance
        .run_string(
            r#"
            local gen = coroutine.wrap(function()
                for i = 1, 3 do
                    lunet.sleep(0.001)
                    coroutine.yield(i)
                end
            end)
            local sum = 0
            for _ = 1, 3 do
                sum = sum + gen()
            end
            lunet.say(sum)

            local co = coroutine.create(function(a)
                local b = coroutine.yield(a + 1)
                lunet.sleep(0)
                return b * 2
            end)
            local _, first = coroutine.resume(co, 1)
            local _, second = coroutine.resume(co, 10)
            lunet.say(first, " ", second, " ", coroutine.status(co))
            "#,
        )
        .expect("run");
    assert_eq!(out.contents(), "6\n2 20 dead\n");
}

#[test]
fn test_bare_yield_fails_the_coroutine() {
    let (instance, _out) = start_instance();
    let err = instance
        .run_string("coroutine.yield(1)")
        .expect_err("top-level yield is refused");
    assert!(
        err.to_string().contains("attempt to yield across the host boundary"),
        "{err}"
    );
}

#[test]
fn test_ctx_persists_across_suspensions_and_is_cleared() {
    let (instance, out) = start_instance();
    instance
        .run_string(
            r#"
            lunet.ctx.name = "first"
            lunet.say(lunet.get_phase())
            lunet.sleep(0.001)
            lunet.say(lunet.ctx.name)
            "#,
        )
        .expect("run");
    instance
        .run_string(r#"lunet.say(tostring(lunet.ctx.name))"#)
        .expect("run");
    assert_eq!(out.contents(), "content\nfirst\nnil\n");
}

#[test]
fn test_concurrent_submissions_never_overlap_in_the_vm() {
    let (instance, _out) = start_instance();
    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..10 {
                    instance
                        .run_string(
                            r#"
                            lunet.ctx.n = (lunet.ctx.n or 0) + 1
                            lunet.sleep(0.001)
                            lunet.ctx.n = lunet.ctx.n + 1
                            lunet.sleep(0)
                            assert(lunet.ctx.n == 2, "ctx leaked between coroutines")
                            "#,
                        )
                        .expect("run");
                }
            });
        }
    });
    let stats = instance.stats();
    assert_eq!(stats.peak_vm_concurrency, 1);
    assert!(stats.resumes >= 8 * 10 * 3, "{stats:?}");
}

#[test]
fn test_dispatch_and_wait() {
    let (instance, out) = start_instance();
    for i in 0..5 {
        instance
            .dispatch(Request::source(format!("lunet.sleep(0.002) lunet.say({i})")))
            .expect("dispatch");
    }
    instance.wait();
    let mut lines: Vec<String> = out.contents().lines().map(String::from).collect();
    lines.sort();
    assert_eq!(lines, vec!["0", "1", "2", "3", "4"]);
}

#[test]
fn test_per_invocation_output_override() {
    let (instance, default_out) = start_instance();
    let own = BufferSink::new();
    instance
        .submit(
            Request::source("lunet.say('mine') lunet.sleep(0) lunet.say('still mine')")
                .with_output(Arc::new(own.clone())),
        )
        .expect("run");
    assert_eq!(own.contents(), "mine\nstill mine\n");
    assert_eq!(default_out.contents(), "");
}

#[test]
fn test_request_accessors() {
    let (instance, out) = start_instance();
    let request = RequestContext::new("POST", "/items?id=7")
        .with_header("Accept", "text/plain")
        .with_header("X-Multi", "one")
        .with_header("x-multi", "two")
        .with_body("payload");
    instance
        .submit(
            Request::source(
                r#"
                lunet.say(lunet.req.get_method(), " ", lunet.req.get_uri())
                local h = lunet.req.get_headers()
                lunet.say(h.accept, " ", h["x-multi"][1], ",", h["x-multi"][2])
                lunet.say(lunet.req.get_body_data())
                "#,
            )
            .with_request(request),
        )
        .expect("run");
    assert_eq!(out.contents(), "POST /items?id=7\ntext/plain one,two\npayload\n");

    instance
        .run_string(
            r#"
            local ok, err = pcall(lunet.req.get_method)
            lunet.say(tostring(ok), " ", tostring(err):find("no request found") ~= nil)
            "#,
        )
        .expect("run");
    assert!(out.contents().ends_with("false true\n"), "{}", out.contents());
}

#[test]
fn test_resolve_literal_address() {
    let (instance, out) = start_instance();
    instance
        .run_string(
            r#"
            local addrs, err = lunet.resolve("127.0.0.1")
            assert(addrs, err)
            lunet.say(#addrs, " ", addrs[1])
            local none, msg = lunet.resolve("")
            lunet.say(tostring(none), " ", msg)
            "#,
        )
        .expect("run");
    assert_eq!(out.contents(), "1 127.0.0.1\nnil host name expected\n");
}

#[test]
fn test_stop_interrupts_suspended_coroutines() {
    let (instance, _out) = start_instance();
    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| instance.run_string("lunet.sleep(60)"));
        assert!(eventually(|| instance.stats().resumes >= 1));
        instance.stop();
        let outcome = waiter.join().expect("waiter thread");
        assert_eq!(outcome, Err(ScriptError::Interrupted));
    });
    assert!(!instance.is_running());
    assert_eq!(instance.run_string("return 1"), Err(ScriptError::NotRunning));
}

#[test]
fn test_log_functions_are_callable() {
    let (instance, _out) = start_instance();
    instance
        .run_string(
            r#"lunet.log.info("info ", 1) lunet.log.debug({"a", "b"}) lunet.log.error("e")"#,
        )
        .expect("run");
}
