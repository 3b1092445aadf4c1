//! Sync dispatch through the public API.

use std::sync::Arc;

use procbus::{
    AnyInstruction, Bus, BusBuilder, BusConfig, BusError, FixedActor, HandlerCatalog,
    MemoryProcessRepository, ProcessRepository, ProcessStatus, ResultsView, SubStatus, Trigger,
};
use procbus_testing::fixtures::{
    self, AsyncHelloCommand, HelloCommand, ERROR, HELLO, HELLO_TOO, PANIC,
};
use serde_json::json;

struct World {
    repository: Arc<MemoryProcessRepository>,
    catalog: Arc<HandlerCatalog<()>>,
}

fn world() -> World {
    World {
        repository: Arc::new(MemoryProcessRepository::new()),
        catalog: Arc::new(fixtures::catalog().unwrap()),
    }
}

impl World {
    fn single(&self) -> BusBuilder<()> {
        Bus::single(self.repository.clone(), self.catalog.clone())
    }

    fn multiple(&self) -> BusBuilder<()> {
        Bus::multiple(self.repository.clone(), self.catalog.clone())
    }
}

#[tokio::test]
async fn hello_command_finishes_with_feedback() {
    let world = world();
    let bus = world.single().map::<HelloCommand>([HELLO]).build().unwrap();

    let process = bus
        .dispatch(&HelloCommand::new("Hello world"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(process.status(), ProcessStatus::Finished);
    assert!(process.is_successful());
    assert!(process.started_at().is_some());
    assert!(process.finished_at() >= process.started_at());
    assert_eq!(
        serde_json::to_value(process.results()).unwrap(),
        json!([{"status": "succeed", "feedback": "Hello world"}])
    );
    match process.results_view() {
        ResultsView::Single(sub) => assert_eq!(sub.feedback.as_deref(), Some("Hello world")),
        other => panic!("expected a single result, got {other:?}"),
    }

    let stored = world.repository.retrieve(process.id()).await.unwrap();
    assert_eq!(stored, process);
}

#[tokio::test]
async fn failing_handler_is_kept_as_failed() {
    let world = world();
    let bus = world.single().map::<HelloCommand>([ERROR]).build().unwrap();

    let process = bus
        .dispatch(&HelloCommand::new("not today"))
        .await
        .unwrap()
        .unwrap();

    assert!(process.is_finished());
    assert!(process.has_failures());
    assert_eq!(process.results()[0].status, SubStatus::Failed);
    assert_eq!(process.results()[0].feedback.as_deref(), Some("not today"));
    assert_eq!(world.repository.count(Some("finished")).await.unwrap(), 1);
}

#[tokio::test]
async fn panicking_handler_is_recorded_as_failed() {
    let world = world();
    let bus = world.single().map::<HelloCommand>([PANIC]).build().unwrap();

    let process = bus
        .dispatch(&HelloCommand::new("boom"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(process.results()[0].status, SubStatus::Failed);
    assert_eq!(
        process.results()[0].feedback.as_deref(),
        Some("handler panicked: boom")
    );
}

#[tokio::test]
async fn fan_out_reports_results_per_handler() {
    let world = world();
    let bus = world
        .multiple()
        .map::<HelloCommand>([HELLO, HELLO_TOO, ERROR])
        .build()
        .unwrap();

    let process = bus.dispatch(&HelloCommand::new("hi")).await.unwrap().unwrap();

    assert!(process.is_finished());
    assert!(!process.is_successful());
    match process.results_view() {
        ResultsView::Keyed(entries) => {
            let summary: Vec<(&str, SubStatus)> =
                entries.iter().map(|(id, sub)| (*id, sub.status)).collect();
            assert_eq!(
                summary,
                vec![
                    (HELLO, SubStatus::Succeed),
                    (HELLO_TOO, SubStatus::Succeed),
                    (ERROR, SubStatus::Failed),
                ]
            );
        }
        other => panic!("expected keyed results, got {other:?}"),
    }
}

#[tokio::test]
async fn command_bus_stops_on_exception_but_keeps_the_failure() {
    let world = world();
    let bus = world
        .single()
        .with_config(BusConfig::command_bus())
        .map::<HelloCommand>([ERROR])
        .build()
        .unwrap();

    let err = bus.publish(&HelloCommand::new("refused")).await.unwrap_err();
    match err {
        BusError::Handler { handler, source } => {
            assert_eq!(handler, ERROR);
            assert_eq!(source.to_string(), "refused");
        }
        other => panic!("expected a handler error, got {other}"),
    }

    let stats = world.repository.stats().await.unwrap();
    assert_eq!(stats.finished, 1);
    assert_eq!(stats.total(), 1);
}

#[tokio::test]
async fn command_bus_leaves_no_record_for_success() {
    let world = world();
    let bus = world
        .single()
        .with_config(BusConfig::command_bus())
        .map::<HelloCommand>([HELLO])
        .build()
        .unwrap();

    let process = bus
        .publish(&HelloCommand::new("quiet"))
        .await
        .unwrap()
        .unwrap();

    assert!(process.is_successful());
    assert_eq!(process.bus(), "command-bus");
    assert!(world.repository.is_empty());
}

#[tokio::test]
async fn dispatch_multiple_reports_each_instruction() {
    let world = world();
    let bus = world.single().map::<HelloCommand>([HELLO]).build().unwrap();

    let first = HelloCommand::new("one");
    // Async without a queue: fails before anything is written.
    let broken = AsyncHelloCommand::new("two");
    let last = HelloCommand::new("three");

    let batch: [&dyn AnyInstruction; 3] = [&first, &broken, &last];
    let results = bus
        .dispatch_multiple(Trigger::of::<HelloCommand>(), &batch)
        .await;

    assert_eq!(results.len(), 3);
    let feedback = |i: usize| {
        results[i].as_ref().unwrap().as_ref().unwrap().results()[0]
            .feedback
            .clone()
    };
    assert_eq!(feedback(0).as_deref(), Some("one"));
    assert!(matches!(
        results[1],
        Err(BusError::MissingConfiguration { .. })
    ));
    assert_eq!(feedback(2).as_deref(), Some("three"));
    assert_eq!(world.repository.count(None).await.unwrap(), 2);
}

#[tokio::test]
async fn unmapped_trigger_depends_on_configuration() {
    let world = world();

    let strict = world.single().build().unwrap();
    assert!(matches!(
        strict.dispatch(&HelloCommand::new("x")).await,
        Err(BusError::MissingHandler { .. })
    ));

    let lenient = world
        .single()
        .with_config(BusConfig::default().with_throw_when_no_handler(false))
        .build()
        .unwrap();
    assert!(lenient
        .dispatch(&HelloCommand::new("x"))
        .await
        .unwrap()
        .is_none());
    assert!(world.repository.is_empty());
}

#[tokio::test]
async fn config_and_actor_are_recorded() {
    let world = world();
    let config: BusConfig = serde_json::from_value(json!({
        "name": "orders",
        "stop_on_exception": true
    }))
    .unwrap();
    assert!(config.persist_sync_instructions);

    let bus = world
        .single()
        .with_config(config)
        .with_actor(Arc::new(FixedActor(7)))
        .map::<HelloCommand>([HELLO])
        .build()
        .unwrap();

    let process = bus
        .dispatch(&HelloCommand::new("hello"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(process.bus(), "orders");
    assert_eq!(process.committed_by(), Some(7));
    assert_eq!(process.pid(), Some(std::process::id()));
    assert_eq!(process.instruction(), std::any::type_name::<HelloCommand>());
}

#[test]
fn registration_time_validation() {
    let world = world();

    assert!(matches!(
        world.single().map::<HelloCommand>([HELLO, ERROR]).build(),
        Err(BusError::InvalidHandler { .. })
    ));
    assert!(matches!(
        world.multiple().map::<HelloCommand>(["unknown"]).build(),
        Err(BusError::InvalidHandler { .. })
    ));

    let mut bus = world.multiple().build().unwrap();
    let trigger = Trigger::of::<HelloCommand>();
    assert!(!bus.has_handler(&trigger));
    bus.map(trigger, [HELLO]).unwrap();
    bus.map(trigger, [HELLO_TOO, HELLO]).unwrap();
    assert_eq!(bus.handler(&trigger).unwrap(), vec![HELLO, HELLO_TOO]);
}
