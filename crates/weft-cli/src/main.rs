use async_trait::async_trait;
use serde::Deserialize;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weft_core::queue::{Queue, QueueConfig, RetryPolicy};
use weft_core::{Envelope, Flow, FlowError, GraphSpec, Handler, HandlerRegistry, TaskError};

#[derive(Debug, Deserialize)]
struct Registration {
    email: String,
    #[serde(default)]
    avatar: Option<String>,
}

/// Checks a registration; fails the first `n` calls to show queue retries.
struct CheckRegistration {
    remaining_failures: AtomicU32,
}

impl CheckRegistration {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Handler for CheckRegistration {
    async fn handle(
        &self,
        _ctx: &CancellationToken,
        envelope: Envelope,
    ) -> Result<Envelope, FlowError> {
        let reg: Registration = envelope.convert_to()?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(FlowError::handler(format!(
                "intentional failure (left={left})"
            )));
        }

        let status = if reg.email.contains('@') { "pass" } else { "fail" };
        info!(email = %reg.email, avatar = ?reg.avatar, status, "registration checked");
        Ok(envelope.with_status(status))
    }
}

fn register_demo_handlers(registry: &HandlerRegistry) {
    registry.register_fn("greet", |_, env: Envelope| async move {
        let text = env.to_text()?;
        Ok(env.with_payload(format!("hello {text}")))
    });
    registry.register_fn("shout", |_, env: Envelope| async move {
        let text = env.to_text()?.to_uppercase();
        Ok(env.with_payload(text))
    });
    registry.register_fn("split-words", |_, env: Envelope| async move {
        let text = env.to_text()?;
        let words: Vec<serde_json::Value> =
            text.split_whitespace().map(serde_json::Value::from).collect();
        Ok(env.with_payload(serde_json::Value::Array(words)))
    });
    registry.register_fn("welcome", |_, env: Envelope| async move {
        Ok(env.with_payload("welcome aboard"))
    });
    registry.register_fn("reject", |_, env: Envelope| async move {
        Ok(env.with_payload("registration rejected"))
    });
    registry.register("check-registration", CheckRegistration::new(2));
}

async fn run_flow(flow: &Flow, input: Envelope) -> Result<(), FlowError> {
    let out = flow.process(&CancellationToken::new(), input).await?;
    println!("[{}] -> {}", flow.name(), out.to_text()?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // (A) handlers
    let registry = HandlerRegistry::global();
    register_demo_handlers(registry);

    // (B) a spec file given on the command line runs instead of the demos
    let mut args = std::env::args().skip(1);
    if let Some(path) = args.next() {
        let raw = std::fs::read(&path)?;
        let flow = Flow::from_json(path.clone(), &raw, registry)?;
        let input = args.next().unwrap_or_default();
        run_flow(&flow, Envelope::new(input)).await?;
        return Ok(());
    }

    // (C) demo flows: linear, loop
    let basic = Flow::build(
        "basic",
        &GraphSpec::new().edge("greet", "shout"),
        registry,
    )?;
    run_flow(&basic, Envelope::new("weft")).await?;

    let words = Flow::build(
        "words",
        &GraphSpec::new()
            .loop_over("split-words", ["shout"])
            .first_node("split-words"),
        registry,
    )?;
    run_flow(&words, Envelope::new("one two three")).await?;

    // (D) branch flow, retried through a queue until the flaky check passes
    let signup = Flow::build(
        "signup",
        &GraphSpec::new()
            .conditional("check-registration", [("pass", "welcome"), ("fail", "reject")])
            .first_node("check-registration"),
        registry,
    )?;

    let queue = Arc::new(Queue::from_config(QueueConfig {
        name: "signups".into(),
        retry: RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            max_timeout_ms: 1_000,
            jitter: false,
            ..RetryPolicy::default()
        },
    }));
    queue.start(CancellationToken::new());

    let task = queue
        .submit(move |ctx| {
            let flow = signup.clone();
            async move {
                let input = Envelope::new(r#"{"email":"ada@example.com","avatar":"ada.svg"}"#);
                let out = flow.process(&ctx, input).await?;
                println!("[{}] -> {}", flow.name(), out.to_text()?);
                Ok::<(), TaskError>(())
            }
        })
        .await?;

    // (E) stop intake and wait for the queue to drain
    queue.shutdown().await;
    match task.result() {
        Ok(()) => info!(attempts = task.attempts(), "signup task finished"),
        Err(err) => warn!(attempts = task.attempts(), error = %err, "signup task failed"),
    }
    info!(flows = ?registry.flows().names(), "done");
    Ok(())
}
