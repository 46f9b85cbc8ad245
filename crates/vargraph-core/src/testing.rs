//! Test doubles shared by the module tests

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::provider::{Provider, ResolutionContext, Resolver};
use crate::value::{Opaque, Value};

/// Calls seen by a [`mock_provider`], as `(resolver type, key, params)`
pub type CallLog = Arc<Mutex<Vec<(String, String, Vec<Value>)>>>;

/// A callable handed out by the `fn` key
pub struct Callback(pub fn() -> &'static str);

/// A `mock` provider whose every resolver switches on the key:
/// `json` → `{foo: bar}`, `param` → first param, `echo` → `"resolved"`,
/// `missing` → no value, `recurse` → `"${mock:echo}"`, `unclosed` →
/// `"${unclosed"`, `shared` → a fresh value per call, `error` → fails,
/// `fn` → an opaque callable, `number` → 42, anything else → `"value:<key>"`.
pub fn mock_provider() -> (Provider, CallLog) {
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicU64::new(0));
    let mut provider = Provider::new("mock");
    for resolver_type in ["default", "myKey", "json", "value", "recurse", "shared", "missing", "error"] {
        let calls = Arc::clone(&calls);
        let counter = Arc::clone(&counter);
        provider = provider.with_fn(resolver_type, move |key: &str, params: &[Value], _: &ResolutionContext| {
            calls
                .lock()
                .unwrap()
                .push((resolver_type.to_string(), key.to_string(), params.to_vec()));
            mock_value(key, params, &counter)
        });
    }
    (provider, calls)
}

fn mock_value(key: &str, params: &[Value], counter: &AtomicU64) -> Result<Option<Value>> {
    Ok(Some(match key {
        "json" => {
            let mut map = IndexMap::new();
            map.insert("foo".to_string(), Value::from("bar"));
            Value::Mapping(map)
        }
        "param" => return Ok(params.first().cloned()),
        "echo" => Value::from("resolved"),
        "missing" => return Ok(None),
        "recurse" => Value::from("${mock:echo}"),
        "unclosed" => Value::from("${unclosed"),
        "shared" => Value::String(format!("shared-{}", counter.fetch_add(1, Ordering::SeqCst))),
        "error" => return Err(Error::configuration("mock failure")),
        "fn" => Value::Opaque(Opaque::new(Callback(|| "called"))),
        "number" => Value::Integer(42),
        other => Value::String(format!("value:{}", other)),
    }))
}

/// Resolver types and keys of every recorded call
pub fn calls_of(log: &CallLog) -> Vec<(String, String)> {
    log.lock()
        .unwrap()
        .iter()
        .map(|(t, k, _)| (t.clone(), k.clone()))
        .collect()
}

/// `start:<key>` and `end:<key>` entries written by [`Delayed`]
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// Resolver that sleeps before answering every key with the same reply
pub struct Delayed {
    pub delay: Duration,
    pub reply: &'static str,
    pub events: EventLog,
}

#[async_trait]
impl Resolver for Delayed {
    async fn resolve(&self, key: &str, _params: &[Value], _ctx: &ResolutionContext) -> Result<Option<Value>> {
        self.events.lock().unwrap().push(format!("start:{}", key));
        tokio::time::sleep(self.delay).await;
        self.events.lock().unwrap().push(format!("end:{}", key));
        Ok(Some(Value::from(self.reply)))
    }
}

/// A provider named `name` whose default resolver is a [`Delayed`]
pub fn delayed_provider(name: &str, delay_ms: u64, reply: &'static str, events: &EventLog) -> Provider {
    Provider::new(name).with_default(Arc::new(Delayed {
        delay: Duration::from_millis(delay_ms),
        reply,
        events: Arc::clone(events),
    }))
}
