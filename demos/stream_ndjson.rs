//! Streams newline-delimited JSON from stdin into a pipe.
//!
//! Configuration comes from `SNOWFLAKE_*` environment variables (see
//! `ClientConfig::from_env`). Pass `--best-effort` to skip failed batches
//! instead of stopping at the first one.
//!
//! ```text
//! RUST_LOG=snowpipe_stream=info cargo run --example stream_ndjson < events.ndjson
//! ```

use std::error::Error;

use serde_json::Value;
use snowpipe_stream::{ClientConfig, StreamingClient, WriteError, WriteMode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mode = if std::env::args().any(|a| a == "--best-effort") {
        WriteMode::BestEffort
    } else {
        WriteMode::FailFast
    };

    let config = ClientConfig::from_env()?;
    let client = StreamingClient::from_config(&config)?;

    let mut session = client.session(0);
    session.open().await?;
    println!("opened channel {}", session.channel_name());

    // Lines are read as the writer pulls them, one batch at a time.
    let records = std::io::stdin()
        .lines()
        .enumerate()
        .filter_map(|(number, line)| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => match serde_json::from_str::<Value>(&line) {
                Ok(value) => Some(value),
                Err(e) => {
                    eprintln!("skipping line {}: {e}", number + 1);
                    None
                }
            },
            Err(e) => {
                eprintln!("cannot read line {}: {e}", number + 1);
                None
            }
        });

    let result = client.batch_writer(mode).write(records, &mut session).await;
    let outcome = match result {
        Ok(summary) => {
            println!("{summary}");
            for failed in &summary.failed_batches {
                println!(
                    "failed records {:?} (bytes {:?}): {}",
                    failed.records, failed.bytes, failed.error
                );
            }
            Ok(())
        }
        Err(e) => {
            if let WriteError::Aborted { records, .. } = &e {
                println!("stopped at records {records:?}");
            }
            println!("{}", e.summary());
            Err(e)
        }
    };

    if let Ok(status) = session.status().await {
        println!(
            "server reports {} rows inserted, {} errors",
            status.rows_inserted, status.error_count
        );
    }
    session.close().await;

    outcome.map_err(Into::into)
}
