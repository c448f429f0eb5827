use longrun::activity::FnActivity;
use longrun::coordinator::{Coordinator, InstanceProgress, StartOutcome};
use longrun::gateway::{RequestKind, TriggerGateway, TriggerRequest, ACK_LAUNCHED};
use longrun::store::in_memory::InMemoryInstanceStore;
use longrun::store::sqlite::SqliteInstanceStore;
use longrun::store::InstanceStore;
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::*;

async fn double_start_core(store: Arc<dyn InstanceStore>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = Coordinator::start(
        store.clone(),
        Arc::new(FnActivity(|input: String| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(input)
        })),
        notifier.clone(),
    );

    let (a, b) = tokio::join!(
        coordinator.start_instance("U-race", "first"),
        coordinator.start_instance("U-race", "second"),
    );
    let outcomes = [a.unwrap(), b.unwrap()];

    // Exactly one start wins; the other is suppressed as a duplicate.
    assert_eq!(
        outcomes.iter().filter(|o| **o == StartOutcome::Started).count(),
        1,
        "outcomes: {outcomes:?}"
    );
    assert_eq!(
        outcomes.iter().filter(|o| **o == StartOutcome::Duplicate).count(),
        1,
        "outcomes: {outcomes:?}"
    );

    let progress = coordinator
        .wait_for_instance("U-race", Duration::from_secs(5))
        .await
        .unwrap();
    // The surviving run carries whichever input won the create race.
    match progress {
        InstanceProgress::Completed { ref result } => {
            assert!(result == "first" || result == "second", "result: {result}");
        }
        other => panic!("expected Completed, got {other:?}"),
    }

    // One instance, one notification.
    assert_eq!(notifier.deliveries().len(), 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn concurrent_double_start_yields_one_instance_in_memory() {
    double_start_core(Arc::new(InMemoryInstanceStore::default())).await;
}

#[tokio::test]
async fn concurrent_double_start_yields_one_instance_sqlite() {
    let store = Arc::new(SqliteInstanceStore::new_in_memory().await.unwrap());
    double_start_core(store).await;
}

#[tokio::test]
async fn repeated_launches_from_one_requester_are_suppressed() {
    let store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = Coordinator::start(
        store.clone(),
        Arc::new(FnActivity(|_input: String| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("once".to_string())
        })),
        notifier.clone(),
    );
    let gateway = TriggerGateway::new(coordinator.clone());

    for _ in 0..3 {
        let ack = gateway
            .handle_trigger(TriggerRequest {
                requester: "U-repeat".to_string(),
                kind: RequestKind::Launch,
                payload: String::new(),
            })
            .await;
        // The requester always hears the same acknowledgement.
        assert_eq!(ack.text, ACK_LAUNCHED);
    }

    let progress = coordinator
        .wait_for_instance("U-repeat", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(
        progress,
        InstanceProgress::Completed {
            result: "once".to_string()
        }
    );
    assert_eq!(notifier.deliveries().len(), 1);

    // Even after completion, the id stays bound to its finished instance.
    let ack = gateway
        .handle_trigger(TriggerRequest {
            requester: "U-repeat".to_string(),
            kind: RequestKind::Launch,
            payload: String::new(),
        })
        .await;
    assert_eq!(ack.text, ACK_LAUNCHED);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(notifier.deliveries().len(), 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn independent_instances_run_concurrently() {
    let store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = Coordinator::start(
        store.clone(),
        Arc::new(FnActivity(|input: String| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(format!("done:{input}"))
        })),
        notifier.clone(),
    );

    for id in ["U-a", "U-b", "U-c"] {
        coordinator.start_instance(id, id).await.unwrap();
    }
    for id in ["U-a", "U-b", "U-c"] {
        let progress = coordinator.wait_for_instance(id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            progress,
            InstanceProgress::Completed {
                result: format!("done:{id}")
            }
        );
    }

    let mut recipients: Vec<String> = notifier.deliveries().into_iter().map(|(to, _)| to).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["U-a", "U-b", "U-c"]);

    coordinator.shutdown().await;
}
