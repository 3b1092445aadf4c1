//! Who dispatched an instruction.

/// Supplies the acting user's id, recorded as a process's `committed_by`.
pub trait ActorProvider: Send + Sync + 'static {
    fn actor_id(&self) -> Option<i64>;
}

/// No authenticated actor; processes record `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoActor;

impl ActorProvider for NoActor {
    fn actor_id(&self) -> Option<i64> {
        None
    }
}

/// Always the same actor. Useful for system jobs and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedActor(pub i64);

impl ActorProvider for FixedActor {
    fn actor_id(&self) -> Option<i64> {
        Some(self.0)
    }
}
