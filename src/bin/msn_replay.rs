//! Replays a stream of stamped messages against one leaf and reports what
//! the sequence-number filter accepted.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Once};

use bytes::Bytes;
use clap::Parser;
use fractree::db::{FileTreeStore, MemTreeStore, TreeStore};
use fractree::storage::{UpdateAction, Xids};
use fractree::{GcContext, Message, MessageKind, Msn, Tree, TreeConfig, TxnId};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "msn-replay",
    version,
    about = "Apply newline-delimited JSON messages to a leaf and summarize the result"
)]
struct Cli {
    #[arg(value_name = "FILE", help = "Message stream, one JSON object per line ('-' for stdin)")]
    input: PathBuf,

    #[arg(long, value_name = "SEED", help = "Shuffle delivery order with a seeded RNG")]
    shuffle: Option<u64>,

    #[arg(long, value_name = "FILE", help = "TOML tree configuration")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Persist the tree in this directory instead of memory"
    )]
    store: Option<PathBuf>,

    #[arg(long, default_value_t = 0, help = "Oldest transaction referenced by a reader snapshot")]
    oldest_referenced: u64,

    #[arg(long, default_value_t = 0, help = "Oldest transaction that may still be live")]
    oldest_live: u64,

    #[arg(long, help = "Log leaf activity to stderr")]
    verbose: bool,
}

/// One line of the input stream.
#[derive(Debug, Deserialize)]
struct MessageRecord {
    kind: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Option<String>,
    msn: u64,
    #[serde(default)]
    xids: Vec<u64>,
}

#[derive(Debug, Serialize)]
struct EntryReport {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct ReplaySummary {
    messages: usize,
    accepted: u64,
    rejected: u64,
    work_performed: u64,
    watermark: u64,
    high_water: u64,
    entries: Vec<EntryReport>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    if cli.verbose {
        init_tracing();
    }

    let config = match cli.config.as_ref() {
        Some(path) => TreeConfig::load(path)?,
        None => TreeConfig::default(),
    };
    let options = config.into_options().update_fn(Arc::new(append_update));
    let store: Arc<dyn TreeStore> = match cli.store.as_ref() {
        Some(dir) => Arc::new(FileTreeStore::open(dir)?),
        None => Arc::new(MemTreeStore::new()),
    };

    let mut messages = read_messages(&cli.input)?;
    if let Some(seed) = cli.shuffle {
        messages.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
    }

    let gc = GcContext::new(
        TxnId(cli.oldest_referenced),
        TxnId(cli.oldest_live),
        false,
    );
    let tree = Tree::open(store, options)?;
    let root = tree.root();
    for msg in &messages {
        tree.observe_msn(msg.msn());
        tree.apply(root, msg, &gc)?;
    }

    let stats = tree.stats();
    let summary = {
        let leaf = tree.pin(root)?;
        ReplaySummary {
            messages: messages.len(),
            accepted: stats.accepted,
            rejected: stats.rejected_stale,
            work_performed: stats.work_performed,
            watermark: leaf.max_msn_applied().get(),
            high_water: tree.high_water().get(),
            entries: leaf
                .iter()
                .filter_map(|(key, value)| {
                    value.map(|value| EntryReport {
                        key: String::from_utf8_lossy(key).into_owned(),
                        value: String::from_utf8_lossy(value).into_owned(),
                    })
                })
                .collect(),
        }
    };
    tree.close()?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn read_messages(path: &PathBuf) -> Result<Vec<Message>, Box<dyn Error>> {
    let reader: Box<dyn BufRead> = if path.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        Box::new(BufReader::new(File::open(path)?))
    };
    let mut messages = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: MessageRecord = serde_json::from_str(&line)
            .map_err(|err| format!("line {}: {err}", idx + 1))?;
        messages.push(to_message(record).map_err(|err| format!("line {}: {err}", idx + 1))?);
    }
    Ok(messages)
}

fn to_message(record: MessageRecord) -> Result<Message, Box<dyn Error>> {
    let kind = MessageKind::from_name(&record.kind)
        .ok_or_else(|| format!("unknown message kind '{}'", record.kind))?;
    if record.msn == 0 {
        return Err("msn must be positive".into());
    }
    let xids = Xids::from_ids(record.xids.into_iter().map(TxnId));
    let message = Message::new(
        kind,
        Msn(record.msn),
        Bytes::from(record.key),
        record.value.map(Bytes::from),
        xids,
    )?;
    Ok(message)
}

/// Appends the message extra to the current value.
fn append_update(_key: &[u8], old: Option<&[u8]>, extra: &[u8]) -> UpdateAction {
    if extra.is_empty() {
        return UpdateAction::Delete;
    }
    let mut value = old.unwrap_or_default().to_vec();
    value.extend_from_slice(extra);
    UpdateAction::Set(Bytes::from(value))
}

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fractree=trace"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_ansi(false)
            .try_init();
    });
}
