//! Greeter demo: one sync and one async instruction on an in-memory bus.
//!
//! ```text
//! cargo run -p greeter-demo
//! RUST_LOG=procbus=debug,greeter_demo=info cargo run -p greeter-demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use procbus::{
    AsyncHandlerJob, Bus, BusConfig, ExecutionMode, FixedActor, Handler, HandlerCatalog,
    HandlerOptions, HandlerResult, Instruction, InstructionRegistry, JobOutcome, JobQueue,
    MemoryProcessRepository, ProcessRepository, QueueOptions, WorkerContext,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GreetUser {
    name: String,
}

impl Instruction for GreetUser {
    procbus::self_trigger!();
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SendWelcome {
    name: String,
    email: String,
}

impl Instruction for SendWelcome {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    fn queue_options(&self) -> QueueOptions {
        QueueOptions::default()
            .on_queue("mail")
            .with_timeout(Duration::from_secs(5))
    }

    procbus::self_trigger!();
    procbus::auto_serialize!();
}

struct Deps {
    sender: String,
}

struct Greeter;

#[async_trait]
impl Handler<GreetUser> for Greeter {
    async fn handle(&self, cmd: &GreetUser) -> Result<HandlerResult> {
        Ok(format!("Hello {}", cmd.name).into())
    }
}

struct Mailer {
    sender: String,
}

#[async_trait]
impl Handler<SendWelcome> for Mailer {
    async fn handle(&self, cmd: &SendWelcome) -> Result<HandlerResult> {
        if !cmd.email.contains('@') {
            return Err(anyhow!("invalid address {}", cmd.email));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(HandlerResult::feedback(format!(
            "mail from {} to {}",
            self.sender, cmd.email
        ))
        .with_data(serde_json::json!({ "recipient": cmd.email })))
    }
}

struct AuditLog;

#[async_trait]
impl Handler<SendWelcome> for AuditLog {
    async fn handle(&self, cmd: &SendWelcome) -> Result<HandlerResult> {
        Ok(format!("welcome for {} audited", cmd.name).into())
    }
}

/// Hands jobs to an in-process worker over a channel.
struct ChannelJobQueue {
    tx: mpsc::UnboundedSender<AsyncHandlerJob>,
}

#[async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: AsyncHandlerJob, queue: Option<&str>) -> Result<Uuid> {
        info!(queue = ?queue, handler = %job.handler, "job queued");
        self.tx
            .send(job)
            .map_err(|_| anyhow!("worker has shut down"))?;
        Ok(Uuid::new_v4())
    }

    async fn schedule(
        &self,
        job: AsyncHandlerJob,
        queue: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let delay = (run_at - Utc::now()).to_std().unwrap_or_default();
        info!(queue = ?queue, handler = %job.handler, ?delay, "job scheduled");
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(job);
        });
        Ok(Uuid::new_v4())
    }
}

fn catalog() -> procbus::Result<HandlerCatalog<Deps>> {
    let mut catalog = HandlerCatalog::new(Deps {
        sender: "welcome@example.com".into(),
    });
    catalog.register_with::<GreetUser, _>(HandlerOptions::named("greeter"), Greeter)?;
    catalog.register_factory::<SendWelcome, _, _>(HandlerOptions::named("mailer"), |deps| {
        Ok(Mailer {
            sender: deps.sender.clone(),
        })
    })?;
    catalog.register_with::<SendWelcome, _>(
        HandlerOptions::named("audit").force_sync(),
        AuditLog,
    )?;
    Ok(catalog)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let repository = Arc::new(MemoryProcessRepository::new());
    let catalog = Arc::new(catalog()?);
    let mut instructions = InstructionRegistry::new();
    instructions.register::<SendWelcome>();

    let (tx, mut rx) = mpsc::unbounded_channel::<AsyncHandlerJob>();
    let ctx = WorkerContext::new(repository.clone(), catalog.clone(), Arc::new(instructions));
    let worker = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job.run(&ctx).await {
                Ok(JobOutcome::Applied {
                    status, finished, ..
                }) => info!(handler = %job.handler, %status, finished, "job done"),
                Ok(outcome) => info!(handler = %job.handler, ?outcome, "job skipped"),
                Err(e) => warn!(handler = %job.handler, error = %e, "job failed"),
            }
        }
    });

    let bus = Bus::multiple(repository.clone(), catalog)
        .with_config(BusConfig::default().with_name("greeter").with_clean_when_finished(false))
        .with_job_queue(Arc::new(ChannelJobQueue { tx }))
        .with_actor(Arc::new(FixedActor(1)))
        .map::<GreetUser>(["greeter"])
        .map::<SendWelcome>(["mailer", "audit"])
        .build()?;

    if let Some(process) = bus.dispatch(&GreetUser { name: "Ada".into() }).await? {
        info!(
            process_id = %process.id(),
            status = %process.status(),
            feedback = ?process.results()[0].feedback,
            "greeted"
        );
    }

    let mut queued = Vec::new();
    for (name, email) in [("Ada", "ada@example.com"), ("Bob", "not-an-address")] {
        let welcome = SendWelcome {
            name: name.into(),
            email: email.into(),
        };
        if let Some(process) = bus.dispatch(&welcome).await? {
            info!(process_id = %process.id(), status = %process.status(), "welcome dispatched");
            queued.push(process.id());
        }
    }

    // Closing the channel lets the worker drain and stop.
    drop(bus);
    worker.await?;

    for id in queued {
        let process = repository.retrieve(id).await?;
        info!(
            process_id = %id,
            status = %process.status(),
            successful = process.is_successful(),
            results = %serde_json::to_string(process.results())?,
            "welcome settled"
        );
    }

    let stats = repository.stats().await?;
    info!(
        new = stats.new,
        pending = stats.pending,
        finished = stats.finished,
        canceled = stats.canceled,
        "repository stats"
    );
    Ok(())
}
