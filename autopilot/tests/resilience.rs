//! Retry and fallback behavior of decorated worker handles.

use std::sync::Arc;
use std::time::Duration;

use autopilot::agent::resilient::ResilientAgent;
use autopilot::agent::{AgentError, AgentHandle, ExecOptions};
use autopilot::core::backoff::RetryPolicy;
use autopilot::core::classifier::ErrorKind;
use autopilot::io::config::Scope;
use autopilot::test_support::{ContextBuilder, ScriptedAgent};

fn policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff_ms: 0,
        ..RetryPolicy::default()
    }
}

fn options() -> ExecOptions {
    ExecOptions::new(Duration::from_secs(5))
}

fn decorate(
    primary: &ScriptedAgent,
    fallback: Option<&ScriptedAgent>,
    policy: RetryPolicy,
) -> ResilientAgent {
    ResilientAgent::new(
        Arc::new(primary.clone()),
        fallback.map(|agent| Arc::new(agent.clone()) as Arc<dyn AgentHandle>),
        policy,
    )
}

#[test]
fn primary_succeeds_on_the_last_allowed_attempt() {
    for max_retries in 0..4 {
        let mut primary = ScriptedAgent::new("primary");
        for _ in 0..max_retries {
            primary = primary.respond_exit(1, "flaky");
        }
        let primary = primary.respond_ok(r#"{"ok":true}"#);
        let agent = decorate(&primary, None, policy(max_retries));

        let value = agent
            .execute_structured("go", &options())
            .expect("succeeds within budget");
        assert_eq!(value["ok"], true);
        assert_eq!(primary.calls() as u32, max_retries + 1);
    }
}

#[test]
fn exhausted_primary_hands_off_to_fallback_once() {
    let primary = ScriptedAgent::new("primary")
        .respond_exit(1, "boom")
        .respond_exit(1, "boom")
        .respond_exit(1, "boom");
    // Non-zero exit from the fallback is returned as-is, not retried.
    let fallback = ScriptedAgent::new("fallback").respond_exit(7, "fallback says no");
    let agent = decorate(&primary, Some(&fallback), policy(2));

    let output = agent.execute("go", &options()).expect("fallback output");
    assert_eq!(primary.calls(), 3);
    assert_eq!(fallback.calls(), 1);
    assert_eq!(output.exit_code, Some(7));
    assert_eq!(output.stderr, "fallback says no");
}

#[test]
fn fallback_error_is_returned_verbatim() {
    let primary = ScriptedAgent::new("primary").respond_exit(1, "boom");
    let fallback = ScriptedAgent::new("fallback").respond_err(AgentError::Auth {
        worker: "fallback".to_string(),
        message: "bad key".to_string(),
    });
    let agent = decorate(&primary, Some(&fallback), policy(0));

    let err = agent.execute_structured("go", &options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(fallback.calls(), 1);
}

#[test]
fn non_retryable_kinds_are_never_retried() {
    let cases = [
        AgentError::Timeout {
            worker: "primary".to_string(),
            timeout: Duration::from_secs(1),
        },
        AgentError::Auth {
            worker: "primary".to_string(),
            message: "401".to_string(),
        },
        AgentError::Spawn {
            worker: "primary".to_string(),
            message: "no such file".to_string(),
        },
    ];
    for case in cases {
        let kind = case.kind();
        let primary = ScriptedAgent::new("primary").respond_err(case);
        let fallback = ScriptedAgent::new("fallback").respond_ok("{}");
        let agent = decorate(&primary, Some(&fallback), policy(5));

        agent
            .execute_structured("go", &options())
            .expect("fallback still gets its attempt");
        assert_eq!(primary.calls(), 1, "{kind:?} must not be retried");
        assert_eq!(fallback.calls(), 1);
    }
}

#[test]
fn rate_limits_are_retried_with_the_flag_on() {
    let primary = ScriptedAgent::new("primary")
        .respond_exit(1, "HTTP 429: rate limit exceeded")
        .respond_ok("{}");
    let agent = decorate(&primary, None, policy(1));
    agent.execute_structured("go", &options()).expect("retried");
    assert_eq!(primary.calls(), 2);

    let primary = ScriptedAgent::new("primary").respond_exit(1, "rate limit exceeded");
    let agent = decorate(&primary, None, policy(0));
    let err = agent.execute_structured("go", &options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimit);
}

#[test]
fn rate_limits_are_plain_failures_with_the_flag_off() {
    let off = RetryPolicy {
        retry_on_rate_limit: false,
        ..policy(1)
    };
    let primary = ScriptedAgent::new("primary")
        .respond_err(AgentError::RateLimited {
            worker: "primary".to_string(),
            message: "429".to_string(),
        })
        .respond_ok("{}");
    let agent = decorate(&primary, None, off.clone());
    agent
        .execute_structured("go", &options())
        .expect("generic retry still applies");
    assert_eq!(primary.calls(), 2);

    let primary = ScriptedAgent::new("primary").respond_exit(1, "rate limit exceeded");
    let agent = decorate(
        &primary,
        None,
        RetryPolicy {
            max_retries: 0,
            ..off
        },
    );
    let err = agent.execute_structured("go", &options()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
}

#[test]
fn pool_decorates_roles_with_policy_and_fallback() {
    let primary = ScriptedAgent::new("primary")
        .respond_exit(1, "a")
        .respond_exit(1, "b");
    let fallback = ScriptedAgent::new("fallback").respond_ok(r#"{"from":"fallback"}"#);
    let (_temp, ctx) = ContextBuilder::new()
        .role("programmer", &primary)
        .fallback("programmer", &fallback)
        .policy("programmer", policy(1))
        .build()
        .expect("context");

    let (worker, handle) = ctx
        .pool
        .get_handle("programmer", Scope::Repository, None)
        .expect("handle");
    assert_eq!(worker, "primary");
    let value = handle
        .execute_structured("go", &ctx.exec_options(Scope::Repository))
        .expect("fallback answer");
    assert_eq!(value["from"], "fallback");
    assert_eq!(primary.calls(), 2);
    assert_eq!(fallback.calls(), 1);
}
