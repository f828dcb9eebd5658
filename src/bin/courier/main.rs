use anyhow::{bail, Result};
use courier::config::{ClientConfig, DlqConfig};
use courier::dlq::{BatchOutcome, DlqError};
use courier::{handler_fn, Client, HandlerError, HandlerResult, Message};
use options::{Command, DlqCommand, LogFormat, MainOptions};
use serde::Serialize;
use std::time::Duration;
use structopt::StructOpt;
use tracing::info;
use view::{DeadLetterView, MessageView, OutcomeView, ReceiptView};

mod options;
mod view;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let options = init();
    let mut config = ClientConfig {
        backend: options.redis.into(),
        persist_metrics: false,
        ..Default::default()
    };

    match options.command {
        Command::Health => {
            let client = Client::connect(config).await?;
            client.health_check().await?;
            println!("ok");
        }
        Command::Publish {
            topic,
            payload,
            metadata,
            service,
        } => {
            config.publisher.service_name = service;

            let client = Client::connect(config).await?;
            let message = metadata
                .into_iter()
                .fold(Message::new(topic, payload), |message, (key, value)| {
                    message.with_metadata(key, value)
                });

            let receipt = client.publish_message(message).await?;
            print_json(&ReceiptView::from(&receipt))?;
        }
        Command::Tail {
            topic,
            group,
            reject,
            consumer,
            retry,
            dlq,
        } => {
            config.consumer = consumer.into();
            config.retry = retry.into();
            config.dlq = dlq.into();
            config.persist_metrics = true;

            tail(Client::connect(config).await?, &topic, &group, reject).await?;
        }
        Command::Dlq { suffix, command } => {
            config.dlq = DlqConfig {
                suffix,
                ..Default::default()
            };

            maintain(Client::connect(config).await?, command).await?;
        }
    }

    Ok(())
}

fn init() -> MainOptions {
    let options = MainOptions::from_args();

    let formatter = tracing_subscriber::fmt()
        .with_env_filter(options.log.as_str())
        .with_writer(std::io::stderr);

    match options.log_format {
        LogFormat::Text => formatter.init(),
        LogFormat::Compact => formatter.compact().init(),
        LogFormat::Json => formatter.json().init(),
    };

    options
}

async fn tail(client: Client, topic: &str, group: &str, reject: bool) -> Result<()> {
    let handler = handler_fn(move |message: Message| async move { print_message(&message, reject) });

    client.subscribe(topic, group, handler).await?;
    info!(%topic, %group, "Tailing topic, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    client.close(SHUTDOWN_TIMEOUT).await?;

    Ok(())
}

fn print_message(message: &Message, reject: bool) -> HandlerResult {
    println!("{}", serde_json::to_string(&MessageView::from(message))?);

    if reject {
        Err(HandlerError::permanent("rejected by operator"))
    } else {
        Ok(())
    }
}

async fn maintain(client: Client, command: DlqCommand) -> Result<()> {
    let dlq = client.dlq();

    match command {
        DlqCommand::List {
            topic,
            offset,
            limit,
        } => {
            let dead_letters = dlq.list(&topic, offset, limit).await?;
            let views: Vec<DeadLetterView> = dead_letters.iter().map(DeadLetterView::from).collect();
            print_json(&views)?;
        }
        DlqCommand::Get { topic, id } => {
            let dead_letter = dlq.get(&topic, &id).await?;
            print_json(&DeadLetterView::from(&dead_letter))?;
        }
        DlqCommand::Reprocess { topic, ids } => {
            print_outcome(dlq.reprocess_batch(&topic, &ids).await)?;
        }
        DlqCommand::Delete { topic, ids } => {
            print_outcome(dlq.delete_batch(&topic, &ids).await)?;
        }
        DlqCommand::Count { topic } => {
            println!("{}", dlq.count(&topic).await?);
        }
        DlqCommand::Purge { topic } => {
            let removed = dlq.purge(&topic).await?;
            info!(%topic, removed, "Purged dead-letter queue");
            println!("{}", removed);
        }
    }

    client.close(SHUTDOWN_TIMEOUT).await?;

    Ok(())
}

fn print_outcome(result: Result<BatchOutcome, DlqError>) -> Result<()> {
    match result {
        Ok(outcome) => print_json(&OutcomeView::from(&outcome)),
        Err(DlqError::Partial(outcome)) => {
            print_json(&OutcomeView::from(&outcome))?;
            bail!("{} of {} operations failed", outcome.failed.len(), outcome.total())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
