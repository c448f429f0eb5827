use std::sync::Arc;
use std::time::Duration;

use longrun::activity::{delay_activity, FnActivity};
use longrun::coordinator::Coordinator;
use longrun::gateway::{RequestKind, TriggerGateway, TriggerRequest};
use longrun::notify::LogNotifier;
use longrun::store::sqlite::SqliteInstanceStore;
use longrun::store::InstanceStore;

// One full pass through the system: a launch request starts the delay
// activity, the gateway acks immediately, and the "push" lands in the log.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn InstanceStore> = Arc::new(SqliteInstanceStore::new_in_memory().await?);
    let coordinator = Coordinator::start(
        store,
        Arc::new(FnActivity(delay_activity)),
        Arc::new(LogNotifier),
    );
    let gateway = TriggerGateway::new(coordinator.clone());

    let ack = gateway
        .handle_trigger(TriggerRequest {
            requester: "U123".to_string(),
            kind: RequestKind::Launch,
            payload: "3".to_string(),
        })
        .await;
    println!("{}", ack.text);

    let progress = coordinator.wait_for_instance("U123", Duration::from_secs(10)).await?;
    println!("instance finished: {progress:?}");

    coordinator.shutdown().await;
    Ok(())
}
