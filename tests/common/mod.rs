//! Shared utilities for integration tests.
//!
//! Starts NATS with JetStream in a container using testcontainers-rs.

#![allow(dead_code)]

use std::time::Duration;

use async_nats::jetstream;
use constellation::broker::Broker;
use constellation::config::BrokerConfig;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    ContainerAsync, GenericImage, ImageExt,
};

/// Start a NATS container with JetStream enabled and return its client URL.
pub async fn start_nats() -> (ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-js"]);

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let host_port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let url = format!("nats://{}:{}", host, host_port);
    println!("NATS available at: {}", url);

    (container, url)
}

/// Attach a broker handle to the container.
pub async fn attach(url: &str) -> Broker {
    Broker::start(&BrokerConfig::external(url))
        .await
        .expect("Failed to attach to NATS")
}

/// Number of messages currently stored in `stream`.
pub async fn stored_messages(jetstream: &jetstream::Context, stream: &str) -> u64 {
    let mut stream = jetstream
        .get_stream(stream)
        .await
        .expect("Stream should exist");
    stream
        .info()
        .await
        .expect("Failed to read stream info")
        .state
        .messages
}
