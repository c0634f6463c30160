//! Scripted end-to-end chat
//!
//! Wires a [`ChatActor`] to a [`ScriptedProvider`], forwards every outbox
//! event onto an [`EventBus`] and prints them from bus subscribers:
//!
//! ```text
//! SendMessage --> ChatActor --> ChatRunner --> ScriptedProvider
//!                     |
//!                  outbox --> EventBus --+--> "agent_message.output_text.delta" (stdout)
//!                                        +--> "*" (json lines, --json)
//! ```

use std::{io::Write, sync::Arc, time::Duration};

use agent::{
  ChatActor, ChatEvent, ChatEventKind, ChatRunner, InMemoryMessageStore, InputItem, InterruptType, RunnerConfig,
  SendMessage,
  messages::EVENT_TEXT_DELTA,
};
use anyhow::{Context, Result};
use events::{ActorOptions, BusOptions, CountingMetrics, EventBus, LoggingTracer, WILDCARD_EVENT_TYPE};
use llm::{LlmResultChunk, ScriptStep, ScriptedProvider};
use parley_core::Config;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Options for `parley demo`
#[derive(Debug, Clone)]
pub struct DemoArgs {
  pub prompt: String,
  pub reply: String,
  pub model: String,
  pub chunk_delay: Duration,
  pub interrupt_after: Option<Duration>,
  pub hang: bool,
  pub fail: Option<String>,
  pub json: bool,
}

/// Split `reply` into word-sized deltas, keeping the separators
fn reply_parts(reply: &str) -> Vec<&str> {
  reply.split_inclusive(' ').collect()
}

/// Scripted provider for `args`, with chunk streams sized by `[stream] capacity`
fn build_provider(args: &DemoArgs, capacity: usize) -> ScriptedProvider {
  if let Some(message) = &args.fail {
    return ScriptedProvider::failing(message.clone());
  }

  let parts = reply_parts(&args.reply);
  let provider = if args.hang {
    let mut steps: Vec<ScriptStep> = parts
      .iter()
      .enumerate()
      .map(|(i, part)| ScriptStep::Chunk(LlmResultChunk::text(&args.model, i as u64, *part)))
      .collect();
    steps.push(ScriptStep::Hang);
    ScriptedProvider::new("scripted", steps)
  } else {
    ScriptedProvider::from_text(&args.model, &parts)
  };

  provider.with_delay(args.chunk_delay).with_capacity(capacity)
}

fn subscribe_printers(bus: &EventBus<ChatEvent>, json: bool) -> Result<()> {
  if json {
    bus.subscribe(WILDCARD_EVENT_TYPE, |event: ChatEvent| async move {
      println!("{}", serde_json::to_string(&event)?);
      Ok(())
    })?;
    return Ok(());
  }

  bus.subscribe(EVENT_TEXT_DELTA, |event: ChatEvent| async move {
    if let ChatEventKind::TextDelta { delta, .. } = &event.kind {
      let mut stdout = std::io::stdout().lock();
      write!(stdout, "{delta}")?;
      stdout.flush()?;
    }
    Ok(())
  })?;
  Ok(())
}

fn print_summary(event: &ChatEvent) {
  let Some(message) = event.agent_message() else {
    return;
  };

  println!();
  println!("--- Response ---");
  println!("ID:             {}", message.id);
  println!("Status:         {:?}", message.status);
  if let Some(usage) = &message.usage {
    println!(
      "Usage:          {} in / {} out ({} total)",
      usage.input_tokens, usage.output_tokens, usage.total_tokens
    );
  }
  if let Some(error) = &message.error {
    println!("Error:          {:?}: {}", error.code, error.message);
  }
  if let Some(details) = &message.incomplete_details {
    println!("Incomplete:     {:?}", details.reason);
  }
  if message.interrupt_type != InterruptType::None {
    println!("Interrupted:    {:?}", message.interrupt_type);
  }
}

/// Run one scripted response and print its events
pub async fn cmd_demo(config: Config, args: DemoArgs) -> Result<()> {
  let root = CancellationToken::new();

  let runner = ChatRunner::new(
    build_provider(&args, config.stream.capacity),
    RunnerConfig::from(&config.runner).with_model(args.model.clone()),
  );
  let store = Arc::new(InMemoryMessageStore::new());
  let chat = ChatActor::new("chat", ActorOptions::from(&config.actor), runner, store.clone())
    .context("Failed to create chat actor")?;

  // One worker keeps deltas in order on stdout
  let metrics = Arc::new(CountingMetrics::default());
  let bus = EventBus::new(
    BusOptions::from(&config.bus)
      .with_worker_count(1)
      .with_metrics(metrics.clone())
      .with_tracer(Arc::new(LoggingTracer))
      .with_error_handler(|e| warn!(error = %e, "Printer failed")),
  );
  subscribe_printers(&bus, args.json)?;

  bus.start(&root)?;
  chat.start(&root)?;

  let response_id = uuid::Uuid::now_v7().to_string();
  info!(response_id = %response_id, "Sending message");
  chat
    .send_message(SendMessage {
      message_id: uuid::Uuid::now_v7().to_string(),
      response_id: Some(response_id.clone()),
      input: vec![InputItem::user_text(args.prompt.clone())],
      tools: Vec::new(),
    })
    .await?;

  let interrupt_at = args.interrupt_after.map(|after| Instant::now() + after);
  let mut interrupt_sent = false;
  let mut last = None;

  loop {
    let event = tokio::select! {
      _ = tokio::signal::ctrl_c(), if !interrupt_sent => {
        warn!("Ctrl-C received, interrupting response");
        chat.interrupt(response_id.clone()).await?;
        interrupt_sent = true;
        continue;
      }
      _ = tokio::time::sleep_until(interrupt_at.unwrap_or_else(Instant::now)), if interrupt_at.is_some() && !interrupt_sent => {
        info!("Interrupt timer fired");
        chat.interrupt(response_id.clone()).await?;
        interrupt_sent = true;
        continue;
      }
      event = chat.receive() => event?,
    };

    let mut stop = event.is_terminal();
    if let ChatEventKind::Error { code, message } = &event.kind {
      eprintln!("error ({}): {}", code.as_deref().unwrap_or("unknown"), message);
      stop = true;
    }

    bus.publish(event.clone()).await?;
    if stop {
      last = Some(event);
      break;
    }
  }

  chat.stop().await;
  bus.stop(Duration::from_secs(5)).await?;

  if let Some(event) = &last
    && !args.json
  {
    print_summary(event);
  }

  let snapshot = metrics.snapshot();
  info!(
    published = snapshot.published,
    processed = snapshot.processed,
    errors = snapshot.errors,
    stored = store.len(),
    "Demo finished"
  );

  root.cancel();
  Ok(())
}
