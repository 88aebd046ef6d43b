//! ksqlDB command-line client
//!
//! A thin wrapper around the ksql library.

use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use ksql::{
    Client, ClientConfig, Context, ExecPayload, KsqlError, Params, QueryPayload,
    QueryStreamPayload, Row, StreamsProperties, build_statement,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "ksql")]
#[command(about = "Command-line client for the ksqlDB REST API")]
#[command(after_help = "\
EXAMPLES:
    # Run a statement
    ksql exec 'LIST STREAMS;'

    # Bind parameters ($n in order, values parsed as JSON or taken as strings)
    ksql exec 'INSERT INTO PAGEVIEWS (ID, VIEWTIME) VALUES ($1, $2);' --arg a --arg 1

    # Follow a push query from the beginning of the topic
    ksql stream --earliest 'SELECT * FROM PAGEVIEWS EMIT CHANGES;'

    # Insert JSON rows read from stdin, one per line
    echo '{\"ID\":\"a\",\"VIEWTIME\":1}' | ksql insert PAGEVIEWS
")]
struct Args {
    /// ksqlDB server URL
    #[arg(long, env = "KSQL_URL", default_value = "http://localhost:8088", global = true)]
    url: String,

    /// Streams property override, as key=value. May be repeated.
    #[arg(long = "property", short = 'p', value_parser = parse_property, global = true)]
    properties: Vec<(String, String)>,

    /// Timeout for non-streaming requests, in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Use HTTP/2 without negotiation
    #[arg(long, global = true)]
    http2: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run statements other than SELECT
    Exec {
        sql: String,
        /// Value for the next `$n` placeholder; parsed as JSON, else taken as a string
        #[arg(long = "arg")]
        args: Vec<String>,
    },
    /// Run a query and print the buffered result
    Query { sql: String },
    /// Run a push or pull query and print rows as they arrive
    Stream {
        sql: String,
        /// Stop after this many rows
        #[arg(long)]
        limit: Option<usize>,
        /// Read the source from the earliest offset
        #[arg(long)]
        earliest: bool,
    },
    /// Insert JSON rows from stdin into a stream
    Insert { target: String },
    /// Show server information
    Info,
    /// Check server health
    Health,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_row(row: &Row) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(row)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = ClientConfig::new(&args.url).with_http2_prior_knowledge(args.http2);
    if let Some(secs) = args.timeout {
        config = config.with_request_timeout(Duration::from_secs(secs));
    }
    let client = Client::new(config).context("failed to build client")?;
    let properties: StreamsProperties = args.properties.into_iter().collect();

    match args.command {
        Command::Exec { sql, args } => {
            let params = args
                .iter()
                .fold(Params::new(), |params, raw| params.push(parse_arg(raw)));
            let ksql = build_statement(&sql, &params)?;
            let results = client
                .exec(&ExecPayload::new(ksql).with_properties(properties))
                .await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Command::Query { sql } => {
            let mut rows = client
                .query(&QueryPayload::new(sql).with_properties(properties))
                .await?;
            println!("{}", serde_json::to_string(&rows.columns().names())?);
            let mut row = Row::new();
            while rows.next(&mut row)? {
                print_row(&row)?;
            }
        }
        Command::Stream {
            sql,
            limit,
            earliest,
        } => {
            let properties = if earliest {
                properties.offset_earliest()
            } else {
                properties
            };
            let ctx = Context::background();
            let interrupt = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("interrupted, closing query");
                    interrupt.cancel();
                }
            });

            let stream = client
                .query_stream(&ctx, &QueryStreamPayload::new(sql).with_properties(properties))
                .await?;
            println!("{}", serde_json::to_string(&stream.columns().names())?);

            let mut row = Row::new();
            let mut seen = 0;
            while limit.is_none_or(|limit| seen < limit) {
                match stream.next(&mut row).await {
                    Ok(true) => {
                        print_row(&row)?;
                        seen += 1;
                    }
                    Ok(false) => break,
                    Err(KsqlError::Cancelled(_)) => break,
                    Err(e) => {
                        client.close().await.ok();
                        return Err(e.into());
                    }
                }
            }
            log::info!("{} rows received", seen);
        }
        Command::Insert { target } => {
            let ctx = Context::background();
            let writer = client.inserts_stream(&ctx, &target).await?;

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut failed = 0;
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let row: Value = match serde_json::from_str(&line) {
                    Ok(row) => row,
                    Err(e) => {
                        log::error!("skipping invalid JSON line: {}", e);
                        failed += 1;
                        continue;
                    }
                };
                let seq = writer.next_seq();
                match writer.write_json(&ctx, &row).await {
                    Ok(()) => println!("{}: ok", seq),
                    Err(KsqlError::AckNotOk { seq, status, message }) => {
                        failed += 1;
                        println!("{}: {} {}", seq, status, message.unwrap_or_default());
                    }
                    Err(e) => {
                        client.close().await.ok();
                        return Err(e.into());
                    }
                }
            }
            log::info!("{} rows sent, {} rejected", writer.next_seq(), failed);
        }
        Command::Info => {
            let info = client.info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Health => {
            let health = client.healthcheck().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.is_healthy {
                anyhow::bail!("server reports unhealthy");
            }
        }
    }

    client.close().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_split_on_first_equals() {
        assert_eq!(
            parse_property("ksql.streams.auto.offset.reset=earliest").unwrap(),
            ("ksql.streams.auto.offset.reset".to_string(), "earliest".to_string())
        );
        assert_eq!(parse_property("a=b=c").unwrap().1, "b=c");
        assert!(parse_property("novalue").is_err());
    }

    #[test]
    fn args_fall_back_to_strings() {
        assert_eq!(parse_arg("42"), Value::from(42));
        assert_eq!(parse_arg("PAGEVIEWS"), Value::from("PAGEVIEWS"));
        assert_eq!(parse_arg("\"quoted\""), Value::from("quoted"));
    }

    #[test]
    fn cli_parses() {
        let args = Args::try_parse_from([
            "ksql",
            "--url",
            "http://ksql:8088",
            "stream",
            "--limit",
            "5",
            "SELECT * FROM S EMIT CHANGES;",
        ])
        .unwrap();
        assert_eq!(args.url, "http://ksql:8088");
        assert!(matches!(args.command, Command::Stream { limit: Some(5), .. }));
    }
}
