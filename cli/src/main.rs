use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{arg, command, value_parser, Command};
use dotenv::dotenv;
use feed_actors::buffer::EventBuffer;
use feed_actors::data_source::{ChainHead, JsonRpcDataSource};
use feed_actors::feed::FeedTimeouts;
use feed_actors::metrics::create_shared_metrics;
use feed_actors::range_query::{RangeQueryWorker, Recipient};
use feed_actors::BlockRange;
use feed_protocol::EventCategory;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::get_cli_config;

mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ignore faillures as .env might not be present at runtime, and this use-case is tolerated
    dotenv()
        .inspect_err(|err| eprintln!("[WARN] reading .env files is failed with err {err}"))
        .ok();

    let config = get_cli_config()?;

    // logs go to stderr, stdout is reserved for results
    let (non_blocking_appender, _guard_stderr) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_appender)
        .with_filter(config.rust_log);
    tracing_subscriber::registry()
        .with(stderr_subscriber)
        .init();

    let topics = config.topics()?;
    let source = Arc::new(JsonRpcDataSource::new(
        &config.rpc_url,
        Duration::from_millis(config.rpc_timeout_ms),
        topics.clone(),
        config.hub_address,
    )?);

    let matches = command!() // requires `cargo` feature
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("head")
                .alias("h")
                .about("print the current chain head"),
        )
        .subcommand(
            Command::new("range")
                .alias("r")
                .about("print one category's events over an inclusive block range")
                .arg(arg!(<CATEGORY> "event category, e.g. transfer"))
                .arg(arg!(<FROM> "first block").value_parser(value_parser!(u64)))
                .arg(arg!(<TO> "last block").value_parser(value_parser!(u64))),
        )
        .get_matches();

    match matches.subcommand() {
        Some(("head", _)) => {
            let head = source.block_number().await?;
            println!("{head}");
        }
        Some(("range", sub_matches)) => {
            let category = sub_matches
                .get_one::<String>("CATEGORY")
                .context("CATEGORY is required")?
                .parse::<EventCategory>()?;
            let from = *sub_matches.get_one::<u64>("FROM").context("FROM is required")?;
            let to = *sub_matches.get_one::<u64>("TO").context("TO is required")?;
            if from > to {
                bail!("empty range, {from} is above {to}");
            }
            if !topics.contains(category) {
                bail!("no topic configured for {category}");
            }
            let count = print_range(source, category, BlockRange::new(from, to)).await?;
            info!(%category, from, to, count, "Range printed");
        }
        _ => (),
    };

    Ok(())
}

/// Runs a single range query into a fresh buffer and prints it in key order.
async fn print_range(
    source: Arc<JsonRpcDataSource>,
    category: EventCategory,
    range: BlockRange,
) -> anyhow::Result<usize> {
    let metrics = create_shared_metrics();
    let (buffer, buffer_handle) =
        EventBuffer::spawn("cli", FeedTimeouts::default(), metrics.clone());
    RangeQueryWorker::new(
        source,
        category,
        range,
        Recipient::Buffer(buffer.clone()),
        metrics,
    )
    .run()
    .await?;

    let events = buffer.take_all().await?;
    for event in &events {
        println!("{}", serde_json::to_string(event)?);
    }

    _ = buffer
        .shutdown()
        .await
        .inspect_err(|err| error!("failed to shutdown buffer: {err}"));
    buffer_handle.await??;
    Ok(events.len())
}
