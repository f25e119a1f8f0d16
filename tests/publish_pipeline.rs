//! File dispatcher against the in-memory broker.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use amqp_tools::memory::MemoryBroker;
use amqp_tools::{
    DispatcherConfig, Error, FileDispatcher, IdentifierGenerator, PublishResult, ResultSummary,
    RunStatus, ShutdownSignal,
};
use tokio::sync::mpsc;

fn write_files(dir: &Path, count: usize, extension: &str) -> Vec<PathBuf> {
    (1..=count)
        .map(|i| {
            let path = dir.join(format!("file-{:02}.{}", i, extension));
            std::fs::write(&path, format!("{{\"n\":{}}}", i)).unwrap();
            path
        })
        .collect()
}

fn config(workers: usize) -> DispatcherConfig {
    let mut config = DispatcherConfig::new("amqp://memory", "orders", "order.created");
    config.workers = workers;
    config
}

async fn run(
    broker: &MemoryBroker,
    config: DispatcherConfig,
    files: &[PathBuf],
) -> Vec<PublishResult> {
    let (sender, queue) = mpsc::unbounded_channel();
    for file in files {
        sender.send(file.clone()).unwrap();
    }
    drop(sender);

    let mut results = FileDispatcher::new(Arc::new(broker.clone()), config).spawn(queue);
    let mut collected = Vec::new();
    while let Some(result) = results.recv().await {
        collected.push(result);
    }
    collected
}

#[tokio::test]
async fn every_file_published_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let files = write_files(dir.path(), 20, "json");
    let broker = MemoryBroker::new();

    let mut config = config(3);
    config.properties.message_id = IdentifierGenerator::series();
    let results = run(&broker, config, &files).await;

    assert_eq!(results.len(), 20);
    assert!(results.iter().all(|r| r.is_success()));

    let targets: HashSet<String> = results.iter().map(|r| r.target.clone()).collect();
    let expected: HashSet<String> = files.iter().map(|f| f.display().to_string()).collect();
    assert_eq!(targets, expected);

    let published = broker.published();
    assert_eq!(published.len(), 20);
    assert_eq!(broker.channel_count(), 3);

    let ids: HashSet<String> = published
        .iter()
        .map(|p| p.message.properties.message_id.clone().unwrap())
        .collect();
    let expected_ids: HashSet<String> = (1..=20).map(|i| i.to_string()).collect();
    assert_eq!(ids, expected_ids);

    for message in &published {
        assert_eq!(message.exchange, "orders");
        assert_eq!(message.routing_key, "order.created");
        assert_eq!(
            message.message.properties.content_type.as_deref(),
            Some("application/json")
        );
    }
}

#[tokio::test]
async fn configured_content_type_wins_over_extension() {
    let dir = tempfile::tempdir().unwrap();
    let files = write_files(dir.path(), 2, "json");
    let broker = MemoryBroker::new();

    let mut config = config(1);
    config.properties.content_type = "application/vnd.orders+json".to_string();
    run(&broker, config, &files).await;

    for message in broker.published() {
        assert_eq!(
            message.message.properties.content_type.as_deref(),
            Some("application/vnd.orders+json")
        );
    }
}

#[tokio::test]
async fn fault_with_one_worker_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let files = write_files(dir.path(), 5, "json");
    let broker = MemoryBroker::new();
    broker.fault_channel_after(0, 3);

    let results = run(&broker, config(1), &files).await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_success());
    assert!(results[1].is_success());
    assert!(results[2].fatal);
    assert_eq!(results[2].target, files[2].display().to_string());
    assert!(matches!(results[2].error, Some(Error::ChannelFault(_))));
}

#[tokio::test]
async fn fault_with_three_workers_leaves_the_others_running() {
    let dir = tempfile::tempdir().unwrap();
    let files = write_files(dir.path(), 9, "json");
    let broker = MemoryBroker::new();
    broker.fault_channel_after(0, 1);

    let results = run(&broker, config(3), &files).await;

    assert_eq!(results.len(), 9);
    assert_eq!(results.iter().filter(|r| r.fatal).count(), 1);
    assert_eq!(results.iter().filter(|r| r.is_success()).count(), 8);

    let targets: HashSet<&str> = results.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets.len(), 9);

    let mut summary = ResultSummary::default();
    results.iter().for_each(|r| summary.record(r));
    assert_eq!(summary.status(), RunStatus::Fatal);
}

#[tokio::test]
async fn nack_is_a_partial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut files = write_files(dir.path(), 3, "json");
    let poison = dir.path().join("poison.json");
    std::fs::write(&poison, "poison").unwrap();
    files.push(poison.clone());

    let broker = MemoryBroker::new();
    broker.nack_bodies_containing("poison");

    let results = run(&broker, config(2), &files).await;
    assert_eq!(results.len(), 4);

    let failed: Vec<&PublishResult> = results.iter().filter(|r| !r.is_success()).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].target, poison.display().to_string());
    assert!(!failed[0].fatal);
    assert!(matches!(failed[0].error, Some(Error::ConfirmNegative(_))));

    let mut summary = ResultSummary::default();
    results.iter().for_each(|r| summary.record(r));
    assert_eq!(summary.status().exit_code(), 9);
}

#[tokio::test]
async fn shutdown_stops_workers_without_results() {
    let dir = tempfile::tempdir().unwrap();
    let files = write_files(dir.path(), 4, "json");
    let broker = MemoryBroker::new();

    let shutdown = ShutdownSignal::new();
    shutdown.trigger();

    let (sender, queue) = mpsc::unbounded_channel();
    for file in &files {
        sender.send(file.clone()).unwrap();
    }
    let mut results = FileDispatcher::new(Arc::new(broker.clone()), config(2))
        .with_shutdown(shutdown)
        .spawn(queue);

    assert!(results.recv().await.is_none());
    assert!(broker.published().is_empty());
}
