//! Loop fan-out: one worker per collection element, merged on the way back.
//!
//! Results are collected in completion order. The output array is therefore
//! NOT guaranteed to follow the input order; callers that care must carry an
//! index inside the elements themselves.

use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Graph;
use crate::domain::{Envelope, Payload};
use crate::error::FlowError;

/// Run `children` over every element of `items`.
///
/// Every element gets its own copy of `input` with the payload replaced by
/// the element. The first failure cancels the token shared by all workers;
/// the call still waits for every worker before returning that failure.
/// There is no bound on the number of workers.
pub(super) async fn run(
    graph: &Arc<Graph>,
    children: &[String],
    ctx: &CancellationToken,
    input: &Envelope,
    items: Vec<Value>,
    path: &[String],
) -> Result<Vec<Value>, FlowError> {
    let token = ctx.child_token();
    let mut workers = JoinSet::new();
    debug!(flow = %graph.name, elements = items.len(), "loop fan-out");

    for item in items {
        let graph = Arc::clone(graph);
        let children = children.to_vec();
        let token = token.clone();
        let path = path.to_vec();
        let element = input.clone().with_payload(Payload::Json(item));

        workers.spawn(async move {
            let merged = run_children(&graph, &children, &token, element, &path).await;
            // Checkpoint: once a sibling has failed the result is dropped.
            merged.map(|value| (!token.is_cancelled()).then_some(value))
        });
    }

    let mut results = Vec::with_capacity(workers.len());
    let mut failure: Option<FlowError> = None;
    while let Some(joined) = workers.join_next().await {
        let outcome = joined.unwrap_or_else(|e| Err(FlowError::Join(e.to_string())));
        match outcome {
            Ok(Some(value)) => results.push(value),
            Ok(None) => {}
            Err(err) => {
                if failure.is_none() {
                    warn!(flow = %graph.name, error = %err, "loop element failed; cancelling siblings");
                    token.cancel();
                    failure = Some(err);
                }
            }
        }
    }

    match failure {
        Some(err) => Err(err),
        None if token.is_cancelled() => Err(FlowError::Cancelled),
        None => Ok(results),
    }
}

/// Run each child against the same element and merge what they return.
async fn run_children(
    graph: &Arc<Graph>,
    children: &[String],
    token: &CancellationToken,
    element: Envelope,
    path: &[String],
) -> Result<Value, FlowError> {
    let mut merged: Option<Value> = None;
    for child in children {
        let out = graph
            .run_vertex(child, token, element.clone(), path)
            .await?
            .into_envelope();
        let value = out.payload.into_value();
        merged = Some(match merged {
            None => value,
            Some(acc) => merge_first_wins(acc, value),
        });
    }
    Ok(merged.unwrap_or(Value::Null))
}

/// Fold `later` into `acc` without overwriting: only keys missing from `acc`
/// are added. Non-object values never replace what is already there.
fn merge_first_wins(mut acc: Value, later: Value) -> Value {
    if let (Value::Object(acc_map), Value::Object(later_map)) = (&mut acc, later) {
        for (key, value) in later_map {
            acc_map.entry(key).or_insert(value);
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_writer_wins() {
        let merged = merge_first_wins(
            json!({"name": "first", "a": 1}),
            json!({"name": "second", "b": 2}),
        );
        assert_eq!(merged, json!({"name": "first", "a": 1, "b": 2}));
    }

    #[test]
    fn scalars_are_not_overwritten() {
        assert_eq!(merge_first_wins(json!("kept"), json!("dropped")), json!("kept"));
        assert_eq!(
            merge_first_wins(json!({"a": 1}), json!("dropped")),
            json!({"a": 1})
        );
    }
}
