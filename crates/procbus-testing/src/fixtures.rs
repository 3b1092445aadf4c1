//! Ready-made instructions and handlers.
//!
//! Handler ids are constants so tests can map and look them up by name.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use procbus::{
    ExecutionMode, Handler, HandlerCatalog, HandlerOptions, HandlerResult, Instruction,
    InstructionRegistry, QueueOptions,
};
use serde::{Deserialize, Serialize};

pub const HELLO: &str = "hello";
pub const HELLO_TOO: &str = "hello-too";
pub const ERROR: &str = "error";
pub const PANIC: &str = "panic";
pub const ASYNC_HELLO: &str = "async-hello";
pub const ASYNC_HELLO_TOO: &str = "async-hello-too";
pub const ASYNC_ERROR: &str = "async-error";
pub const ASYNC_SLOW: &str = "async-slow";
pub const ASYNC_FORCE_SYNC: &str = "async-force-sync";

/// A sync command greeting whoever handles it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloCommand {
    pub greeting: String,
}

impl HelloCommand {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
        }
    }
}

impl Instruction for HelloCommand {
    procbus::self_trigger!();
    procbus::auto_serialize!();
}

/// The async twin of [`HelloCommand`], delayed by 20 minutes on queue
/// `custom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncHelloCommand {
    pub greeting: String,
}

impl AsyncHelloCommand {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            greeting: greeting.into(),
        }
    }
}

impl Instruction for AsyncHelloCommand {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Async
    }

    fn queue_options(&self) -> QueueOptions {
        QueueOptions::default()
            .on_queue("custom")
            .with_delay(Duration::from_secs(20 * 60))
    }

    procbus::self_trigger!();
    procbus::auto_serialize!();
}

/// Replies with the greeting.
pub struct HelloHandler;

#[async_trait]
impl Handler<HelloCommand> for HelloHandler {
    async fn handle(&self, command: &HelloCommand) -> anyhow::Result<HandlerResult> {
        Ok(command.greeting.as_str().into())
    }
}

#[async_trait]
impl Handler<AsyncHelloCommand> for HelloHandler {
    async fn handle(&self, command: &AsyncHelloCommand) -> anyhow::Result<HandlerResult> {
        Ok(command.greeting.as_str().into())
    }
}

/// Fails with the greeting as its message.
pub struct ErrorHandler;

#[async_trait]
impl Handler<HelloCommand> for ErrorHandler {
    async fn handle(&self, command: &HelloCommand) -> anyhow::Result<HandlerResult> {
        Err(anyhow!("{}", command.greeting))
    }
}

#[async_trait]
impl Handler<AsyncHelloCommand> for ErrorHandler {
    async fn handle(&self, command: &AsyncHelloCommand) -> anyhow::Result<HandlerResult> {
        Err(anyhow!("{}", command.greeting))
    }
}

/// Panics with the greeting.
pub struct PanicHandler;

#[async_trait]
impl Handler<HelloCommand> for PanicHandler {
    async fn handle(&self, command: &HelloCommand) -> anyhow::Result<HandlerResult> {
        panic!("{}", command.greeting);
    }
}

/// Sleeps before replying, so concurrent jobs overlap.
pub struct SlowHandler {
    pub delay: Duration,
}

#[async_trait]
impl Handler<AsyncHelloCommand> for SlowHandler {
    async fn handle(&self, command: &AsyncHelloCommand) -> anyhow::Result<HandlerResult> {
        tokio::time::sleep(self.delay).await;
        Ok(HandlerResult::feedback(format!("slow {}", command.greeting)))
    }
}

/// Catalog with every fixture handler under its constant id.
pub fn catalog() -> procbus::Result<HandlerCatalog<()>> {
    let mut catalog = HandlerCatalog::new(());

    catalog.register_with::<HelloCommand, _>(HandlerOptions::named(HELLO), HelloHandler)?;
    catalog.register_with::<HelloCommand, _>(HandlerOptions::named(HELLO_TOO), HelloHandler)?;
    catalog.register_with::<HelloCommand, _>(HandlerOptions::named(ERROR), ErrorHandler)?;
    catalog.register_with::<HelloCommand, _>(HandlerOptions::named(PANIC), PanicHandler)?;

    catalog.register_with::<AsyncHelloCommand, _>(
        HandlerOptions::named(ASYNC_HELLO),
        HelloHandler,
    )?;
    catalog.register_with::<AsyncHelloCommand, _>(
        HandlerOptions::named(ASYNC_HELLO_TOO),
        HelloHandler,
    )?;
    catalog.register_with::<AsyncHelloCommand, _>(
        HandlerOptions::named(ASYNC_ERROR),
        ErrorHandler,
    )?;
    catalog.register_with::<AsyncHelloCommand, _>(
        HandlerOptions::named(ASYNC_SLOW),
        SlowHandler {
            delay: Duration::from_millis(20),
        },
    )?;
    catalog.register_with::<AsyncHelloCommand, _>(
        HandlerOptions::named(ASYNC_FORCE_SYNC).force_sync(),
        HelloHandler,
    )?;

    Ok(catalog)
}

/// Registry that can rebuild both fixture commands from job payloads.
pub fn instructions() -> InstructionRegistry {
    let mut registry = InstructionRegistry::new();
    registry
        .register::<HelloCommand>()
        .register::<AsyncHelloCommand>();
    registry
}
