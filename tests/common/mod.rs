//! Shared fixtures for integration tests.
#![allow(dead_code)]

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use ueba_agent::table::{Column, Table};

pub fn record(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => panic!("fixture record must be an object"),
    }
}

/// `n` login-like rows for one user with a numeric, a boolean and a categorical column.
pub fn login_rows(user: &str, n: usize) -> Vec<Map<String, Value>> {
    (0..n)
        .map(|i| {
            record(json!({
                "userid": user,
                "bytes": 100 + (i % 7) as i64 * 3,
                "mfa": i % 2 == 0,
                "city": if i % 5 == 0 { "Berlin" } else { "Paris" },
                "session": format!("s{}", i / 2),
            }))
        })
        .collect()
}

pub fn login_table(user: &str, n: usize) -> Table {
    Table::from_records(&login_rows(user, n))
}

/// Single numeric column `v` holding 0..n and the given natural index.
pub fn indexed_table(index: Vec<i64>) -> Table {
    let n = index.len();
    Table::with_index(
        index,
        vec![Column::new("v", (0..n).map(|i| json!(i)).collect())],
    )
    .expect("column length matches index")
}

pub fn column_values(table: &Table, name: &str) -> Vec<Value> {
    table.column(name).expect("column present").values.clone()
}

/// Counts WARN events seen while installed.
struct WarnCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Run `f` with a thread-local subscriber and return how many warnings it logged.
pub fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarnCounter(count.clone()));
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, count.load(Ordering::SeqCst))
}
