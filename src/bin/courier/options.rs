use courier::config::{ConsumerOptions, DlqOptions, RedisOptions, RetryOptions};
use std::str::FromStr;
use structopt::StructOpt;
use thiserror::Error;

#[derive(Debug, StructOpt)]
#[structopt(about = "Publish, consume and maintain dead letters of courier topics.")]
pub struct MainOptions {
    /// Log level, scopable to different modules
    ///
    /// Levels: trace, debug, info, warn, error
    #[structopt(
        short,
        long,
        global = true,
        default_value = "warn,courier=info",
        env = "RUST_LOG",
        value_name = "level"
    )]
    pub log: String,

    /// Format of log lines
    ///
    /// Formats: text, compact, json
    #[structopt(long, global = true, default_value = "text", env, value_name = "format")]
    pub log_format: LogFormat,

    #[structopt(flatten)]
    pub redis: RedisOptions,

    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Compact,
    Json,
}

#[derive(Debug, Error)]
#[error("unknown log format '{0}'")]
pub struct UnknownLogFormat(String);

impl FromStr for LogFormat {
    type Err = UnknownLogFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(UnknownLogFormat(s.to_owned())),
        }
    }
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Verifies that the backend is reachable
    Health,

    /// Publishes a single message
    Publish {
        /// Target topic
        topic: String,

        /// Message payload
        payload: String,

        /// Additional metadata entries
        #[structopt(short, long = "meta", parse(try_from_str = parse_key_value), value_name = "key=value")]
        metadata: Vec<(String, String)>,

        /// Value of the `source_service` metadata key
        #[structopt(long, env = "SERVICE_NAME")]
        service: Option<String>,
    },

    /// Consumes a topic and prints every message until interrupted
    Tail {
        /// Topic to consume
        topic: String,

        /// Consumer group to join
        group: String,

        /// Let the handler fail every message, e.g. to exercise the dead-letter queue
        #[structopt(long)]
        reject: bool,

        #[structopt(flatten)]
        consumer: ConsumerOptions,

        #[structopt(flatten)]
        retry: RetryOptions,

        #[structopt(flatten)]
        dlq: DlqOptions,
    },

    /// Inspects and maintains dead-letter queues
    Dlq {
        /// Suffix forming the dead-letter stream name from a topic
        #[structopt(long, env, default_value = ".dlq")]
        suffix: String,

        #[structopt(subcommand)]
        command: DlqCommand,
    },
}

#[derive(Debug, StructOpt)]
pub enum DlqCommand {
    /// Lists dead letters in arrival order
    List {
        /// Original topic or dead-letter stream
        topic: String,

        /// Number of entries to skip
        #[structopt(long, default_value = "0")]
        offset: usize,

        /// Maximum number of entries to print
        #[structopt(long, default_value = "20")]
        limit: usize,
    },

    /// Prints a single dead letter
    Get {
        /// Original topic or dead-letter stream
        topic: String,

        /// Dead-letter entry id or message id
        id: String,
    },

    /// Re-publishes dead letters to their original topic
    Reprocess {
        /// Original topic or dead-letter stream
        topic: String,

        /// Dead-letter entry ids or message ids
        #[structopt(required = true)]
        ids: Vec<String>,
    },

    /// Deletes dead letters without re-publishing them
    Delete {
        /// Original topic or dead-letter stream
        topic: String,

        /// Dead-letter entry ids or message ids
        #[structopt(required = true)]
        ids: Vec<String>,
    },

    /// Prints the number of dead letters
    Count {
        /// Original topic or dead-letter stream
        topic: String,
    },

    /// Removes every dead letter of a topic
    Purge {
        /// Original topic or dead-letter stream
        topic: String,
    },
}

#[derive(Debug, Error)]
#[error("expected key=value, got '{0}'")]
pub struct InvalidKeyValue(String);

fn parse_key_value(src: &str) -> Result<(String, String), InvalidKeyValue> {
    match src.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(InvalidKeyValue(src.to_owned())),
    }
}
