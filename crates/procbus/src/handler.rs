//! Handlers and the catalog that resolves them.
//!
//! A [`Handler`] runs business logic for one instruction type. Handlers are
//! registered in a [`HandlerCatalog`] under a handler id, either as ready
//! instances or as factories that build the handler from shared
//! dependencies. Factories run at most once; the built handler is cached by
//! id and reused by the bus and by every worker.
//!
//! ```ignore
//! struct Deps { mailer: Mailer }
//!
//! let mut catalog = HandlerCatalog::new(Deps { mailer });
//! let hello = catalog.register::<HelloCommand, _>(HelloHandler)?;
//! let mail = catalog.register_factory::<SendMail, _, _>(
//!     HandlerOptions::named("mail").force_sync(),
//!     |deps: &Deps| Ok(MailHandler::new(deps.mailer.clone())),
//! )?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;

use crate::error::{BusError, Result};
use crate::instruction::Instruction;
use crate::result::HandlerResult;

/// Identifier of a registered handler, as stored on processes.
pub type HandlerId = String;

/// Business logic for one instruction type.
#[async_trait]
pub trait Handler<I: Instruction>: Send + Sync + 'static {
    /// Errors are recorded as a `Failed` sub-result with the error message
    /// as feedback.
    async fn handle(&self, instruction: &I) -> anyhow::Result<HandlerResult>;
}

#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn handle_any(
        &self,
        instruction: &(dyn Any + Send + Sync),
    ) -> anyhow::Result<HandlerResult>;
}

struct Typed<I, H> {
    handler: H,
    _instruction: PhantomData<fn(I)>,
}

#[async_trait]
impl<I, H> ErasedHandler for Typed<I, H>
where
    I: Instruction,
    H: Handler<I>,
{
    async fn handle_any(
        &self,
        instruction: &(dyn Any + Send + Sync),
    ) -> anyhow::Result<HandlerResult> {
        let instruction = instruction
            .downcast_ref::<I>()
            .ok_or_else(|| anyhow!("handler accepts {} only", I::name()))?;
        self.handler.handle(instruction).await
    }
}

fn erase<I: Instruction, H: Handler<I>>(handler: H) -> Arc<dyn ErasedHandler> {
    Arc::new(Typed {
        handler,
        _instruction: PhantomData,
    })
}

/// Run a handler, turning a panic into an error.
pub(crate) async fn execute(
    handler: &dyn ErasedHandler,
    instruction: &(dyn Any + Send + Sync),
) -> anyhow::Result<HandlerResult> {
    match AssertUnwindSafe(handler.handle_any(instruction))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("handler panicked: {}", panic_message(&panic))),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Registration settings for a handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Handler id; defaults to the handler's type name.
    pub id: Option<String>,
    /// Keep this handler inline even when its instruction is async.
    pub force_sync: bool,
}

impl HandlerOptions {
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            force_sync: false,
        }
    }

    pub fn force_sync(mut self) -> Self {
        self.force_sync = true;
        self
    }
}

type Factory<D> = Box<dyn Fn(&D) -> anyhow::Result<Arc<dyn ErasedHandler>> + Send + Sync>;

struct Registration<D> {
    instruction: &'static str,
    force_sync: bool,
    factory: Factory<D>,
}

/// Resolves handler ids to handler instances.
pub struct HandlerCatalog<D> {
    deps: Arc<D>,
    registrations: HashMap<HandlerId, Registration<D>>,
    resolved: DashMap<HandlerId, Arc<dyn ErasedHandler>>,
}

impl<D: Send + Sync + 'static> HandlerCatalog<D> {
    pub fn new(deps: D) -> Self {
        Self {
            deps: Arc::new(deps),
            registrations: HashMap::new(),
            resolved: DashMap::new(),
        }
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }

    /// Register a handler instance under its type name.
    pub fn register<I, H>(&mut self, handler: H) -> Result<HandlerId>
    where
        I: Instruction,
        H: Handler<I>,
    {
        self.register_with::<I, H>(HandlerOptions::default(), handler)
    }

    pub fn register_with<I, H>(&mut self, options: HandlerOptions, handler: H) -> Result<HandlerId>
    where
        I: Instruction,
        H: Handler<I>,
    {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| std::any::type_name::<H>().to_string());
        let erased = erase::<I, H>(handler);
        let cached = erased.clone();

        let id = self.insert::<I>(
            id,
            options.force_sync,
            Box::new(move |_: &D| Ok(erased.clone())),
        )?;
        self.resolved.insert(id.clone(), cached);
        Ok(id)
    }

    /// Register a factory that builds the handler from the catalog's
    /// dependencies on first use.
    pub fn register_factory<I, H, F>(&mut self, options: HandlerOptions, factory: F) -> Result<HandlerId>
    where
        I: Instruction,
        H: Handler<I>,
        F: Fn(&D) -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| std::any::type_name::<H>().to_string());

        self.insert::<I>(
            id,
            options.force_sync,
            Box::new(move |deps: &D| factory(deps).map(erase::<I, H>)),
        )
    }

    fn insert<I: Instruction>(
        &mut self,
        id: HandlerId,
        force_sync: bool,
        factory: Factory<D>,
    ) -> Result<HandlerId> {
        if self.registrations.contains_key(&id) {
            return Err(BusError::InvalidHandler {
                trigger: I::name().to_string(),
                reason: format!("handler id [{id}] is already registered"),
            });
        }

        self.registrations.insert(
            id.clone(),
            Registration {
                instruction: I::name(),
                force_sync,
                factory,
            },
        );
        Ok(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registrations.contains_key(id)
    }

    pub fn is_force_sync(&self, id: &str) -> bool {
        self.registrations
            .get(id)
            .map(|r| r.force_sync)
            .unwrap_or(false)
    }

    /// Instruction name the handler was registered for.
    pub fn instruction_of(&self, id: &str) -> Option<&'static str> {
        self.registrations.get(id).map(|r| r.instruction)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub(crate) fn resolve(&self, id: &str) -> Result<Arc<dyn ErasedHandler>> {
        if let Some(handler) = self.resolved.get(id) {
            return Ok(handler.clone());
        }

        let registration = self.registrations.get(id).ok_or_else(|| BusError::Unresolvable {
            handler: id.to_string(),
            source: anyhow!("no handler registered under this id"),
        })?;

        let handler = self
            .resolved
            .entry(id.to_string())
            .or_try_insert_with(|| (registration.factory)(&self.deps))
            .map_err(|source| BusError::Unresolvable {
                handler: id.to_string(),
                source,
            })?;

        Ok(handler.clone())
    }
}

impl<D> std::fmt::Debug for HandlerCatalog<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("handlers", &self.registrations.keys().collect::<Vec<_>>())
            .field("resolved", &self.resolved.len())
            .finish()
    }
}
