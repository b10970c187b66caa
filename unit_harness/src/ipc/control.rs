//! Server IPC – control API
//! ========================
//!
//! JSON view of the server's configuration tree. Every call opens a fresh
//! connection through [`HttpClient`] and returns the parsed body whatever the
//! status code: the server reports rejections as `{"error": ...}` bodies, and
//! tests assert on those.

use std::time::Duration;

use serde_json::{Value, json};

use super::{ControlAddr, error::*, http::*};
use crate::error::{HarnessError, HarnessResult};

pub const CONFIG_PATH: &str = "/config";
pub const CERTIFICATES_PATH: &str = "/certificates";
pub const JS_MODULES_PATH: &str = "/js_modules";
pub const STATUS_PATH: &str = "/status";

/// The empty baseline every test starts from.
pub fn empty_config() -> Value {
    json!({"listeners": {}, "applications": {}})
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    http: HttpClient,
    read_timeout: Duration,
}

impl ControlClient {
    pub fn new(addr: ControlAddr) -> Self {
        Self {
            http: HttpClient::new(addr),
            read_timeout: READ_TIMEOUT,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &ControlAddr {
        self.http.addr()
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }

    fn call(&self, method: &str, url: &str, body: Option<&Value>) -> Result<(u16, Value)> {
        let req = HttpRequest::builder()
            .method(method)
            .url(url)
            .maybe_body(body.map(serde_json::to_vec).transpose()?)
            .read_timeout(self.read_timeout)
            .build();
        let resp = self.http.request(&req)?;
        crate::trace!("{method} {url} -> {:?}", resp.status);

        let Some(status) = resp.status else {
            return Err(ClientError::Malformed {
                reason: format!("no status line from {} for {method} {url}", self.addr()),
            });
        };
        if !resp.complete {
            return Err(ClientError::Malformed {
                reason: format!("truncated response to {method} {url}"),
            });
        }
        if resp.body.is_empty() {
            return Ok((status, Value::Null));
        }
        Ok((status, resp.json()?))
    }

    pub fn get(&self, url: &str) -> Result<Value> {
        self.call("GET", url, None).map(|(_, v)| v)
    }

    pub fn put(&self, url: &str, body: &Value) -> Result<Value> {
        self.call("PUT", url, Some(body)).map(|(_, v)| v)
    }

    pub fn post(&self, url: &str, body: &Value) -> Result<Value> {
        self.call("POST", url, Some(body)).map(|(_, v)| v)
    }

    pub fn delete(&self, url: &str) -> Result<Value> {
        self.call("DELETE", url, None).map(|(_, v)| v)
    }

    /// `PUT /config/<path>`; an empty `path` replaces the whole tree.
    pub fn conf(&self, value: &Value, path: &str) -> Result<Value> {
        self.put(&config_url(path), value)
    }

    pub fn conf_get(&self, path: &str) -> Result<Value> {
        self.get(&config_url(path))
    }

    pub fn conf_delete(&self, path: &str) -> Result<Value> {
        self.delete(&config_url(path))
    }

    /// Resets the tree to [`empty_config`]. Idempotent.
    pub fn clear_config(&self) -> HarnessResult<()> {
        let resp = self.conf(&empty_config(), "")?;
        expect_success("clear configuration", &resp)
    }

    /// Deletes every entry of a named store such as `/certificates`.
    pub fn purge_store(&self, store: &str) -> HarnessResult<()> {
        let entries = match self.get(store)? {
            Value::Object(map) => map,
            Value::Null => return Ok(()),
            other => {
                return Err(HarnessError::ControlRejected {
                    operation: format!("list {store}"),
                    response: other.to_string(),
                });
            }
        };
        for name in entries.keys() {
            let resp = self.delete(&format!("{store}/{name}"))?;
            expect_success(&format!("delete {store}/{name}"), &resp)?;
            crate::debug!("purged {store}/{name}");
        }
        Ok(())
    }

    /// Status counters, or `None` when the server has no status endpoint.
    pub fn status(&self) -> Result<Option<Value>> {
        let (code, body) = self.call("GET", STATUS_PATH, None)?;
        Ok((200..300).contains(&code).then_some(body))
    }

    /// Right after a fresh launch every connection and request counter must
    /// be zero.
    pub fn check_status_zeros(&self) -> HarnessResult<()> {
        let Some(status) = self.status()? else {
            crate::debug!("no {STATUS_PATH} endpoint, skipping counter check");
            return Ok(());
        };
        let mut nonzero = Vec::new();
        nonzero_counters(&status, String::new(), &mut nonzero);
        if nonzero.is_empty() {
            Ok(())
        } else {
            Err(HarnessError::ControlRejected {
                operation: "status counters at startup".into(),
                response: nonzero.join(", "),
            })
        }
    }
}

fn config_url(path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        CONFIG_PATH.to_owned()
    } else {
        format!("{CONFIG_PATH}/{path}")
    }
}

fn expect_success(operation: &str, resp: &Value) -> HarnessResult<()> {
    if resp.get("success").is_some() {
        Ok(())
    } else {
        Err(HarnessError::ControlRejected {
            operation: operation.to_owned(),
            response: resp.to_string(),
        })
    }
}

fn nonzero_counters(value: &Value, path: String, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{path}.{k}")
                };
                nonzero_counters(v, child, out);
            }
        }
        Value::Number(n) if n.as_f64() != Some(0.0) => out.push(format!("{path}={n}")),
        _ => {}
    }
}
