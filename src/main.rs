// ABOUTME: Entry point for the fieldstore binary.
// ABOUTME: Parses CLI arguments, initializes tracing, opens the record store, and runs one operation.

use std::process::ExitCode;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use fieldstore_core::codec;
use fieldstore_core::constants::{ConstantFields, Light, Location, Weather, parse_timestamp};
use fieldstore_core::record::RecordId;
use fieldstore_store::{RecordLookup, RecordStore, StoreConfig};
use serde_json::json;

/// Local record store for field data collection.
#[derive(Parser)]
#[command(name = "fieldstore", version, about = "Local record store for field data collection")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Add a record and print its id
    Add {
        /// Schema version (UUID) the body was produced with
        #[arg(long)]
        schema: String,
        /// Record body as JSON text
        #[arg(long)]
        data: String,
        #[command(flatten)]
        constants: ConstantArgs,
    },

    /// Replace the body of a record; constant flags that are given replace
    /// the stored values, the rest are kept
    Update {
        id: i64,
        #[arg(long)]
        data: String,
        #[command(flatten)]
        constants: ConstantArgs,
    },

    /// Print one record as JSON
    Get { id: i64 },

    /// Print summaries of all records, newest first, one JSON object per line
    List,

    /// Delete a record, usually after upload
    Delete { id: i64 },

    /// Print the number of stored records
    Count,
}

#[derive(Args)]
struct ConstantArgs {
    /// When the event happened, "YYYY-MM-DD HH:MM:SS" in UTC (add defaults to
    /// now; update keeps the stored time)
    #[arg(long, value_parser = parse_timestamp)]
    occurred: Option<DateTime<Utc>>,
    #[arg(long, requires = "longitude", allow_negative_numbers = true)]
    latitude: Option<f64>,
    #[arg(long, requires = "latitude", allow_negative_numbers = true)]
    longitude: Option<f64>,
    #[arg(long, value_parser = Weather::from_token)]
    weather: Option<Weather>,
    #[arg(long, value_parser = Light::from_token)]
    light: Option<Light>,
}

impl ConstantArgs {
    fn into_constants(self) -> ConstantFields {
        self.apply_to(ConstantFields::now())
    }

    /// Lay the flags that were given over `base`.
    fn apply_to(self, mut base: ConstantFields) -> ConstantFields {
        if let Some(occurred) = self.occurred {
            base.set_occurred_from(occurred);
        }
        if let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) {
            base.location = Some(Location::new(latitude, longitude));
        }
        if self.weather.is_some() {
            base.weather = self.weather;
        }
        if self.light.is_some() {
            base.light = self.light;
        }
        base
    }
}

/// Validate body text and bring it into canonical form.
fn canonical_body(data: &str) -> anyhow::Result<String> {
    let body = codec::deserialize(data, None).context("--data is not valid JSON")?;
    Ok(codec::serialize(&body)?)
}

fn run(store: &RecordStore, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Add {
            schema,
            data,
            constants,
        } => {
            let data = canonical_body(&data)?;
            let id = store.add(&schema, &data, &constants.into_constants())?;
            println!("{}", json!({ "id": id }));
        }

        Command::Update {
            id,
            data,
            constants,
        } => {
            let data = canonical_body(&data)?;
            let current = match store.get_by_id(RecordId(id))? {
                RecordLookup::Found(loaded) => loaded.record.constants,
                RecordLookup::NotFound => {
                    println!("{}", json!({ "id": id, "found": false }));
                    return Ok(ExitCode::FAILURE);
                }
            };
            let affected = store.update(RecordId(id), &data, &constants.apply_to(current))?;
            println!("{}", json!({ "id": id, "affected": affected }));
            if affected == 0 {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Get { id } => match store.get_by_id(RecordId(id))? {
            RecordLookup::Found(loaded) => {
                let issues: Vec<String> = loaded
                    .issues
                    .iter()
                    .map(|issue| format!("{issue:?}"))
                    .collect();
                let corrupt = loaded.is_corrupt();
                let raw_data = corrupt.then_some(loaded.raw_data.as_str());
                println!(
                    "{}",
                    json!({
                        "record": loaded.record,
                        "corrupt": corrupt,
                        "raw_data": raw_data,
                        "issues": issues,
                    })
                );
            }
            RecordLookup::NotFound => {
                println!("{}", json!({ "id": id, "found": false }));
                return Ok(ExitCode::FAILURE);
            }
        },

        Command::List => {
            for summary in store.list_all() {
                println!("{}", serde_json::to_string(&summary?)?);
            }
        }

        Command::Delete { id } => {
            let deleted = store.delete(RecordId(id))?;
            println!("{}", json!({ "id": id, "deleted": deleted }));
            if !deleted {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Count => {
            println!("{}", json!({ "count": store.count()? }));
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn open_store() -> anyhow::Result<RecordStore> {
    let config = StoreConfig::from_env()?;
    if config.in_memory {
        bail!("FIELDSTORE_IN_MEMORY is set; the command line tool needs a file-backed store");
    }
    Ok(RecordStore::open(&config)?)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("fieldstore=info,fieldstore_store=info")
            }),
        )
        .init();

    let cli = Cli::parse();

    let store = match open_store() {
        Ok(store) => store,
        Err(err) => {
            tracing::error!("record store unusable: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(&store, cli.command) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
