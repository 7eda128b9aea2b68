#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::correctness,
    missing_debug_implementations,
    missing_docs,
    clippy::all,
    clippy::wildcard_imports,
    clippy::needless_borrow,
    clippy::cast_lossless,
    clippy::unused_async,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
    clippy::cloned_instead_of_copied
)]
#![cfg_attr(not(test), forbid(clippy::indexing_slicing))]
#![cfg_attr(not(test), forbid(clippy::string_slice))]
#![allow(
    clippy::match_bool,
    clippy::mixed_read_write_in_expression,
    clippy::bool_assert_comparison,
    clippy::manual_split_once,
    clippy::format_push_string,
    clippy::bool_to_int_with_if
)]
mod config;
pub(crate) mod delivery;
pub(crate) mod error;
pub(crate) mod health;
pub(crate) mod http_server;
pub(crate) mod message;
pub(crate) mod queue;
pub(crate) mod smtp_client;
pub(crate) mod telemetry;
#[cfg(test)]
mod test_relay;
pub(crate) mod utils;

use config::Config;
use delivery::Dispatcher;
use env_logger::Env;
use error::Error;
use http_server::AppState;
use queue::aws::{S3Store, SqsBroker, load_sdk_config};
use queue::{Consumer, ConsumerSettings};
use smtp_client::SmtpRelay;
use std::env;
use std::process;
use std::sync::Arc;
use telemetry::Telemetry;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() {
    // default to info level
    let env = Env::new().filter_or("RUST_LOG", "info");
    env_logger::Builder::from_env(env)
        // disable timestamps - automatically added by systemd
        .format_timestamp(None)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!(
            "Usage: {} <config_file>",
            args.first().map_or("mailbridge", String::as_str)
        );
        process::exit(1);
    }

    let Some(config_path) = args.get(1) else {
        unreachable!("args length checked above")
    };

    let config = match Config::from_file(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to read config: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Error> {
    let telemetry = Arc::new(Telemetry::new(config.failure_threshold)?);
    let relay = Arc::new(SmtpRelay::new(config.relay_settings())?);
    let dispatcher = Dispatcher::new(relay, config.address_policy(), telemetry.clone());
    let shutdown = CancellationToken::new();

    let consumer = match config.queue_url.clone() {
        Some(queue_url) if config.enable_queue_poll => {
            let sdk_config = load_sdk_config(config.aws_region.clone()).await;
            let broker = SqsBroker::new(
                &sdk_config,
                queue_url,
                config.dead_letter_queue_url.clone(),
                config.poll_wait_seconds,
            );
            let consumer = Consumer::new(
                Arc::new(broker),
                Arc::new(S3Store::new(&sdk_config)),
                dispatcher.clone(),
                telemetry.clone(),
                ConsumerSettings {
                    max_receive_count: config.max_receive_count,
                    error_backoff: config.error_backoff(),
                },
            );
            let shutdown = shutdown.clone();
            Some(tokio::spawn(async move { consumer.run(shutdown).await }))
        }
        _ => {
            log::info!("Queue polling disabled, serving HTTP ingestion only");
            None
        }
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("Shutdown requested"),
                Err(e) => log::error!("Failed to listen for shutdown signal: {e}"),
            }
            shutdown.cancel();
        }
    });

    let router = http_server::router(
        AppState::new(&config.pre_shared_secret, dispatcher, telemetry),
        config.max_message_size,
    );
    let served = http_server::serve(&config.http_listen, router, shutdown.clone()).await;
    // Stop the consumer too if the listener failed.
    shutdown.cancel();

    if let Some(consumer) = consumer
        && let Err(e) = consumer.await
    {
        log::error!("Queue consumer task failed: {e}");
    }
    served
}
