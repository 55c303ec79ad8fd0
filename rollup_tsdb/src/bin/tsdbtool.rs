//! Operator tool for rollup-tsdb configurations.
//!
//! `check` validates a configuration and prints the rollups it describes.
//! `replay` applies a JSON-lines stream of operations to a fresh engine whose
//! clock is under the stream's control, printing one JSON line per query.

#![allow(clippy::print_stdout)]

use std::{
    collections::BTreeMap,
    fs,
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand, ValueEnum};
use rollup_tsdb::{
    Backend, Config, EnvironmentId, ManualClock, Query, TimeSeriesEngine, backend, config,
    frequency::Scores,
};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

type Engine<'a> = TimeSeriesEngine<String, String, String, &'a ManualClock>;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration and print its rollups
    Check {
        /// Path to the YAML configuration
        #[clap(long)]
        config: PathBuf,
    },
    /// Apply a JSON-lines stream of operations and print query results
    Replay {
        /// Path to the YAML configuration, built-in rollups if absent
        #[clap(long)]
        config: Option<PathBuf>,
        /// Initial 'now', in unix seconds
        #[clap(long, default_value_t = 0)]
        now: u64,
        /// Output format of query results
        #[clap(long, value_enum, default_value_t = Output::Json)]
        output: Output,
        /// Path to the operations, one JSON object per line
        ops_path: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Output {
    /// Compact JSON, one result per line
    Json,
    /// Indented JSON
    Pretty,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Backend(#[from] backend::Error),
    #[error("Failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Invalid operation on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum Aggregate {
    Counter,
    Distinct,
    Frequency,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
struct QueryArgs {
    start: u64,
    end: Option<u64>,
    rollup: Option<u64>,
    environment: Option<EnvironmentId>,
}

impl From<QueryArgs> for Query {
    fn from(args: QueryArgs) -> Self {
        Query {
            start: args.start,
            end: args.end,
            rollup: args.rollup,
            environment: args.environment,
        }
    }
}

fn default_count() -> u64 {
    1
}

#[derive(Deserialize, Debug)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    SetNow {
        now: u64,
    },
    Advance {
        seconds: u64,
    },
    Incr {
        model: String,
        key: String,
        timestamp: Option<u64>,
        #[serde(default = "default_count")]
        count: u64,
        environment: Option<EnvironmentId>,
    },
    Record {
        model: String,
        key: String,
        values: Vec<String>,
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    },
    RecordFrequency {
        model: String,
        key: String,
        scores: Scores<String>,
        timestamp: Option<u64>,
        environment: Option<EnvironmentId>,
    },
    Merge {
        aggregate: Aggregate,
        model: String,
        destination: String,
        sources: Vec<String>,
        timestamp: Option<u64>,
        environments: Option<Vec<EnvironmentId>>,
    },
    Delete {
        aggregate: Aggregate,
        models: Vec<String>,
        keys: Vec<String>,
        start: Option<u64>,
        end: Option<u64>,
        timestamp: Option<u64>,
        environments: Option<Vec<EnvironmentId>>,
    },
    Range {
        model: String,
        keys: Vec<String>,
        query: QueryArgs,
    },
    Sums {
        model: String,
        keys: Vec<String>,
        query: QueryArgs,
    },
    DistinctSeries {
        model: String,
        keys: Vec<String>,
        query: QueryArgs,
    },
    DistinctTotals {
        model: String,
        keys: Vec<String>,
        query: QueryArgs,
    },
    DistinctUnion {
        model: String,
        keys: Vec<String>,
        query: QueryArgs,
    },
    MostFrequent {
        model: String,
        keys: Vec<String>,
        query: QueryArgs,
        limit: Option<usize>,
    },
    MostFrequentSeries {
        model: String,
        keys: Vec<String>,
        query: QueryArgs,
        limit: Option<usize>,
    },
    FrequencySeries {
        model: String,
        items: FxHashMap<String, Vec<String>>,
        query: QueryArgs,
    },
    FrequencyTotals {
        model: String,
        items: FxHashMap<String, Vec<String>>,
        query: QueryArgs,
    },
    Flush,
}

fn sorted<V>(map: FxHashMap<String, V>) -> BTreeMap<String, V> {
    map.into_iter().collect()
}

fn sorted_scores(scores: Scores<String>) -> BTreeMap<String, f64> {
    scores.into_iter().collect()
}

/// Apply `op`, returning the result of a query or `None` for a write.
#[allow(clippy::too_many_lines)]
fn apply(engine: &Engine<'_>, clock: &ManualClock, op: Op) -> Result<Option<Value>, Error> {
    let value = match op {
        Op::SetNow { now } => {
            clock.set(now);
            return Ok(None);
        }
        Op::Advance { seconds } => {
            clock.advance(seconds);
            return Ok(None);
        }
        Op::Incr {
            model,
            key,
            timestamp,
            count,
            environment,
        } => {
            engine.incr(&model, &key, timestamp, count, environment)?;
            return Ok(None);
        }
        Op::Record {
            model,
            key,
            values,
            timestamp,
            environment,
        } => {
            engine.record(&model, &key, &values, timestamp, environment)?;
            return Ok(None);
        }
        Op::RecordFrequency {
            model,
            key,
            scores,
            timestamp,
            environment,
        } => {
            let items = FxHashMap::from_iter([(key, scores)]);
            engine.record_frequency_multi(&[(model, items)], timestamp, environment)?;
            return Ok(None);
        }
        Op::Merge {
            aggregate,
            model,
            destination,
            sources,
            timestamp,
            environments,
        } => {
            let environments = environments.as_deref();
            match aggregate {
                Aggregate::Counter => {
                    engine.merge(&model, &destination, &sources, timestamp, environments)?;
                }
                Aggregate::Distinct => engine.merge_distinct_counts(
                    &model,
                    &destination,
                    &sources,
                    timestamp,
                    environments,
                )?,
                Aggregate::Frequency => engine.merge_frequencies(
                    &model,
                    &destination,
                    &sources,
                    timestamp,
                    environments,
                )?,
            }
            return Ok(None);
        }
        Op::Delete {
            aggregate,
            models,
            keys,
            start,
            end,
            timestamp,
            environments,
        } => {
            let environments = environments.as_deref();
            match aggregate {
                Aggregate::Counter => {
                    engine.delete(&models, &keys, start, end, timestamp, environments)?;
                }
                Aggregate::Distinct => engine.delete_distinct_counts(
                    &models,
                    &keys,
                    start,
                    end,
                    timestamp,
                    environments,
                )?,
                Aggregate::Frequency => engine.delete_frequencies(
                    &models,
                    &keys,
                    start,
                    end,
                    timestamp,
                    environments,
                )?,
            }
            return Ok(None);
        }
        Op::Flush => {
            engine.flush()?;
            return Ok(None);
        }
        Op::Range { model, keys, query } => {
            serde_json::to_value(sorted(engine.get_range(&model, &keys, &query.into())?))?
        }
        Op::Sums { model, keys, query } => {
            serde_json::to_value(sorted(engine.get_sums(&model, &keys, &query.into())?))?
        }
        Op::DistinctSeries { model, keys, query } => serde_json::to_value(sorted(
            engine.get_distinct_counts_series(&model, &keys, &query.into())?,
        ))?,
        Op::DistinctTotals { model, keys, query } => serde_json::to_value(sorted(
            engine.get_distinct_counts_totals(&model, &keys, &query.into())?,
        ))?,
        Op::DistinctUnion { model, keys, query } => serde_json::to_value(
            engine.get_distinct_counts_union(&model, &keys, &query.into())?,
        )?,
        Op::MostFrequent {
            model,
            keys,
            query,
            limit,
        } => serde_json::to_value(sorted(engine.get_most_frequent(
            &model,
            &keys,
            &query.into(),
            limit,
        )?))?,
        Op::MostFrequentSeries {
            model,
            keys,
            query,
            limit,
        } => serde_json::to_value(sorted(engine.get_most_frequent_series(
            &model,
            &keys,
            &query.into(),
            limit,
        )?))?,
        Op::FrequencySeries {
            model,
            items,
            query,
        } => {
            let series = engine.get_frequency_series(&model, &items, &query.into())?;
            let series: BTreeMap<String, Vec<(u64, BTreeMap<String, f64>)>> = series
                .into_iter()
                .map(|(key, points)| {
                    let points = points
                        .into_iter()
                        .map(|(epoch, scores)| (epoch, sorted_scores(scores)))
                        .collect();
                    (key, points)
                })
                .collect();
            serde_json::to_value(series)?
        }
        Op::FrequencyTotals {
            model,
            items,
            query,
        } => {
            let totals = engine.get_frequency_totals(&model, &items, &query.into())?;
            let totals: BTreeMap<String, BTreeMap<String, f64>> = totals
                .into_iter()
                .map(|(key, scores)| (key, sorted_scores(scores)))
                .collect();
            serde_json::to_value(totals)?
        }
    };
    Ok(Some(value))
}

fn check(path: &Path) -> Result<(), Error> {
    let loaded = Config::from_path(path)?;
    let rollups = loaded.rollups().map_err(config::Error::from)?;
    println!("shards: {}", loaded.shards);
    for rollup in &rollups {
        println!(
            "rollup {width}s: {samples} samples, {lifespan}s retained",
            width = rollup.width(),
            samples = rollup.samples(),
            lifespan = rollup.lifespan(),
        );
    }
    Ok(())
}

fn replay(config: Option<&Path>, now: u64, output: Output, ops_path: &Path) -> Result<(), Error> {
    let config = match config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    let clock = ManualClock::new(now);
    let engine: Engine<'_> = TimeSeriesEngine::with_clock(&config, &clock)?;

    let reader = BufReader::new(fs::File::open(ops_path)?);
    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    let mut applied = 0_usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let op: Op = serde_json::from_str(&line).map_err(|source| Error::Parse {
            line: index + 1,
            source,
        })?;
        debug!(line = index + 1, ?op, "applying");
        if let Some(value) = apply(&engine, &clock, op)? {
            let rendered = match output {
                Output::Json => serde_json::to_string(&value)?,
                Output::Pretty => serde_json::to_string_pretty(&value)?,
            };
            writeln!(stdout, "{rendered}")?;
        }
        applied += 1;
    }
    info!(applied, "replay complete");
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .with_writer(io::stderr)
        .finish()
        .init();

    let args = Args::parse();
    match args.command {
        Command::Check { config } => check(&config),
        Command::Replay {
            config,
            now,
            output,
            ops_path,
        } => replay(config.as_deref(), now, output, &ops_path),
    }
}
