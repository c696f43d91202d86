use std::cmp;
use std::error::Error;

use acromine::{LongForm, LookupClient, LookupOutcome};
use clap::{Parser, Subcommand};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "acromine", about = "Look up acronym definitions via Acromine", version)]
pub struct Cli {
    /// Emit JSON instead of a human-readable table.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve an acronym to its known long forms.
    Lookup {
        /// Acronym to resolve, e.g. HMM.
        acronym: String,
        /// Maximum number of long forms to print.
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

pub fn run() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Lookup { acronym, limit } => handle_lookup(acronym, limit, cli.json),
    }
}

fn handle_lookup(acronym: String, limit: usize, as_json: bool) -> Result<(), Box<dyn Error>> {
    if acronym.trim().is_empty() {
        return Err("Acronym cannot be empty".into());
    }
    let limit = cmp::max(1, limit);
    // The client expects an already-normalized, percent-safe key.
    let key = utf8_percent_encode(&acronym, NON_ALPHANUMERIC).to_string();

    let runtime = tokio::runtime::Runtime::new()?;
    let outcome = runtime.block_on(async {
        let client = LookupClient::new();
        client.lookup(key).await
    });

    let completion = match outcome {
        Some(LookupOutcome::Completed(completion)) => completion,
        Some(LookupOutcome::NoResult) | None => {
            println!("No definitions found for \"{acronym}\".");
            return Ok(());
        }
        Some(LookupOutcome::DuplicateIgnored) => {
            // Single-shot lookup; nothing else can be in flight.
            return Err("lookup was unexpectedly ignored".into());
        }
    };

    if let Some(err) = completion.error {
        return Err(err.into());
    }

    let mut forms = completion.long_forms();
    forms.truncate(limit);

    if as_json {
        let payload = json!({
            "acronym": acronym,
            "long_forms": forms,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        print_long_form_table(&acronym, &forms);
    }
    Ok(())
}

fn print_long_form_table(acronym: &str, forms: &[LongForm]) {
    if forms.is_empty() {
        println!("No definitions found for \"{acronym}\".");
        return;
    }
    let width = forms
        .iter()
        .map(|form| form.name.len())
        .max()
        .unwrap_or(9)
        .max("LONG FORM".len());
    println!("Definitions for \"{acronym}\":");
    println!("{:<width$}  {:>6}  {:>5}  {}", "LONG FORM", "FREQ", "SINCE", "VARS", width = width);
    println!("{:-<width$}  {:->6}  {:->5}  {:-<4}", "", "", "", "", width = width);
    for form in forms {
        println!(
            "{:<width$}  {:>6}  {:>5}  {}",
            form.name,
            form.frequency,
            form.since,
            form.variations.len(),
            width = width
        );
    }
}
