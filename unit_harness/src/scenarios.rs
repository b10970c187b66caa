//! Built-in end-to-end cases.
//!
//! | Name                  | Checks                                                  |
//! |-----------------------|---------------------------------------------------------|
//! | `return_200`          | a `return` route answers `200` on `*:7080`              |
//! | `header_read_timeout` | a stalled request head gets `408`, a patient one `200`  |
//! | `spawn_and_stop`      | an extra instance stops without zombies or leftovers    |

use std::{thread::sleep, time::Duration};

use serde_json::{Value, json};

use crate::{
    error::{HarnessError, HarnessResult},
    ipc::http::HttpRequest,
    session::{driver::TestCase, orchestrator::TestContext},
};

pub const PORT: u16 = 7080;

fn check(cond: bool, what: impl Into<String>) -> HarnessResult<()> {
    if cond {
        Ok(())
    } else {
        Err(HarnessError::Assertion(what.into()))
    }
}

fn check_success(resp: &Value, what: &str) -> HarnessResult<()> {
    check(resp.get("success").is_some(), format!("{what}: {resp}"))
}

fn return_config(settings: Option<Value>) -> Value {
    let mut conf = json!({
        "listeners": {"*:7080": {"pass": "routes"}},
        "routes": [{"action": {"return": 200}}],
        "applications": {},
    });
    if let Some(settings) = settings {
        conf["settings"] = settings;
    }
    conf
}

pub fn return_200(ctx: &mut TestContext<'_>) -> HarnessResult<()> {
    let resp = ctx.control().conf(&return_config(None), "")?;
    check_success(&resp, "configure return route")?;

    let resp = ctx.http(PORT).get("/")?;
    check(resp.status == Some(200), format!("GET / status {:?}", resp.status))
}

/// Sends the request line, stalls for `stall`, then sends the rest of the
/// head on the same connection.
fn stalled_request(ctx: &TestContext<'_>, stall: Duration) -> HarnessResult<Option<u16>> {
    let mut conn = ctx
        .http(PORT)
        .send_only(&HttpRequest::raw(b"GET / HTTP/1.1\r\n".to_vec()))?;
    sleep(stall);
    let resp = conn.request(&HttpRequest::raw(
        b"Host: localhost\r\nConnection: close\r\n\r\n".to_vec(),
    ));
    Ok(resp.status)
}

pub fn header_read_timeout(ctx: &mut TestContext<'_>) -> HarnessResult<()> {
    let timeout = |secs: u64| json!({"http": {"header_read_timeout": secs}});

    let resp = ctx.control().conf(&return_config(Some(timeout(2))), "")?;
    check_success(&resp, "configure header_read_timeout 2")?;
    let status = stalled_request(ctx, Duration::from_secs(3))?;
    check(status == Some(408), format!("status header read timeout: {status:?}"))?;

    let resp = ctx.control().conf(&timeout(7), "settings")?;
    check_success(&resp, "configure header_read_timeout 7")?;
    let status = stalled_request(ctx, Duration::from_secs(3))?;
    check(status == Some(200), format!("status header read timeout 2: {status:?}"))
}

/// Launches a second instance, stops it right away, and checks that it left
/// no zombie and no process behind.
pub fn spawn_and_stop(ctx: &mut TestContext<'_>) -> HarnessResult<()> {
    let census = ctx.census();
    let (settle, interval) = (ctx.options().settle_budget, ctx.options().poll_interval);

    let mut supervisor = ctx.scratch_supervisor();
    let baselines = supervisor.launch(census, ctx.modules(), None)?;
    let pid = baselines.main_pid();

    let failures = supervisor.stop(census);
    let tree = baselines.check_processes(census, settle, interval, true);
    let zombie = census.list_zombies().contains(&pid);
    supervisor.discard()?;

    check(
        failures.is_empty(),
        format!(
            "stop: {}",
            failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
        ),
    )?;
    check(!zombie, format!("zombie child of stopped pid {pid}"))?;
    match tree {
        None => Ok(()),
        Some(failure) => Err(HarnessError::Assertion(failure.to_string())),
    }
}

/// Every built-in case, in run order.
pub fn all() -> Vec<TestCase> {
    vec![
        TestCase::new("return_200", return_200),
        TestCase::new("header_read_timeout", header_read_timeout),
        TestCase::new("spawn_and_stop", spawn_and_stop),
    ]
}
