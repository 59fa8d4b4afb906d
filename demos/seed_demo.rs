//! Seed a database with a pair of sample definitions and one event, then
//! print the resulting rows. Point --database-url of a running worker at
//! the same file to watch the runs execute.
//!
//! Usage: cargo run --example seed_demo -- [database_url]

use chrono::Utc;
use uuid::Uuid;

use taskherd::model::{ConcurrencyPolicy, JobDefinition, JobKind};
use taskherd::schedule::Schedule;
use taskherd::store::RunStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let database_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "sqlite://taskherd.db".to_string());
    let store = RunStore::connect(&database_url).await?;
    let now = Utc::now();

    let heartbeat = JobDefinition {
        id: Uuid::new_v4(),
        name: "demo-heartbeat".to_string(),
        enabled: true,
        kind: JobKind::Time,
        command_name: "echo heartbeat".to_string(),
        default_args: serde_json::json!({}),
        schedule: Schedule::EveryNMinutes { n: 1 },
        timeout_seconds: 30,
        max_retries: 0,
        retry_backoff_seconds: 0,
        concurrency_policy: ConcurrencyPolicy::Forbid,
        created_at: now,
        updated_at: now,
    };
    store.insert_definition(&heartbeat).await?;
    println!("created time definition {} ({})", heartbeat.name, heartbeat.id);

    let on_deploy = JobDefinition {
        id: Uuid::new_v4(),
        name: "demo-on-deploy".to_string(),
        enabled: true,
        kind: JobKind::Event,
        command_name: "echo deploy finished".to_string(),
        default_args: serde_json::json!({"channel": "ops"}),
        schedule: Schedule::Event {
            event_types: vec!["deploy.finished".to_string()],
        },
        timeout_seconds: 30,
        max_retries: 0,
        retry_backoff_seconds: 0,
        concurrency_policy: ConcurrencyPolicy::Allow,
        created_at: now,
        updated_at: now,
    };
    store.insert_definition(&on_deploy).await?;
    println!("created event definition {} ({})", on_deploy.name, on_deploy.id);

    let (event, deduped) = store
        .insert_event(
            "deploy.finished",
            serde_json::json!({"version": "1.2.3"}),
            Some("deploy-1.2.3"),
            now,
        )
        .await?;
    println!("ingested event {} (deduped={deduped})", event.id);

    for run in store.recent_runs(10).await? {
        println!("run {} state={} attempt={}", run.id, run.state, run.attempt);
    }
    Ok(())
}
