use anyhow::Result;
use clap::Parser;
use datachat::config::Config;
use datachat::llm::LlmClient;
use datachat::session::Session;
use datachat::similarity::RemoteScorer;
use datachat::store::value_to_display;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "datachat")]
#[command(about = "Conversational filter extraction over SQLite/CSV/TSV data")]
struct Args {
    /// Data files to load (.sqlite3/.sqlite/.db/.s3db/.sl3, .csv, .tsv)
    files: Vec<PathBuf>,

    /// Natural language requirement; omit for an interactive prompt
    #[arg(short, long)]
    requirement: Option<String>,

    /// Key column to intersect across per-table results
    #[arg(short, long, default_value = "id")]
    key: String,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Chat model name
    #[arg(long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = Config::from_env()?;
    if let Some(key) = args.api_key {
        config.api_key = key;
    }
    if let Some(model) = args.model {
        config.model = model;
    }

    let chat = LlmClient::new(
        config.api_key.clone(),
        config.base_url.clone(),
        config.model.clone(),
    );
    let scorer = RemoteScorer::new(
        config
            .similarity_url
            .clone()
            .unwrap_or_else(|| "http://localhost:8000/similarity".to_string()),
    );

    let mut session = Session::new(Box::new(chat), Box::new(scorer))?;

    info!("Importing {} file(s)", args.files.len());
    let report = session.import_files(&args.files)?;
    for file in &report.files {
        match &file.error {
            Some(err) => eprintln!("  {} failed: {}", file.path.display(), err),
            None => {
                for table in &file.tables {
                    match &table.error {
                        Some(err) => eprintln!("  {} skipped: {}", table.table, err),
                        None => println!("  loaded {} ({} rows)", table.table, table.rows),
                    }
                }
            }
        }
    }

    println!("\nSchema:");
    for table in session.schema()? {
        let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        println!("  {} [{}]", table.name, columns.join(", "));
    }

    let requirement = match args.requirement {
        Some(r) => r,
        None => {
            print!("\nRequirement> ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if requirement.is_empty() {
        println!("No requirement given, exiting");
        return Ok(());
    }

    println!("\nExtracting filters...");
    let outcome = session
        .extract_filters(&requirement, |set| {
            // Progressive echo while the stream is still running.
            println!("  [{} filter(s) so far]", set.len());
        })
        .await?;

    if outcome.empty {
        println!("No filters could be extracted from that requirement");
        return Ok(());
    }
    for failure in &outcome.resolution_failures {
        eprintln!("  match resolution failed for filter {}: {}", failure.index, failure.error);
    }

    println!("\n=== Filters ===");
    for (idx, filter) in session.filters().filters.iter().enumerate() {
        println!(
            "  [{}] {}.{} {} {:?}",
            idx, filter.table, filter.column, filter.operator.as_sql(), filter.value
        );
        let accepted = filter.accepted_matches();
        if !accepted.is_empty() {
            let shown: Vec<String> = accepted
                .iter()
                .map(|m| format!("{} ({:.2})", m.value, m.score))
                .collect();
            println!("      matches: {}", shown.join(", "));
        }
    }

    let applied = session.apply_filters(&args.key);
    println!("\n=== Results ===");
    for result in &applied.results {
        match &result.outcome {
            Err(err) => println!("  {}: query failed: {}", result.table, err),
            Ok(output) => {
                println!("  {}: {} row(s)", result.table, output.rows.len());
                for row in output.rows.iter().take(5) {
                    let rendered: Vec<String> = output
                        .columns
                        .iter()
                        .filter_map(|c| {
                            row.get(c).map(|v| format!("{}={}", c, value_to_display(v)))
                        })
                        .collect();
                    println!("      {}", rendered.join(" "));
                }
            }
        }
    }

    let inter = &applied.intersection;
    println!(
        "\n{} value(s) of {:?} shared across {} table(s){}",
        inter.total,
        args.key,
        inter.tables_considered.len(),
        if inter.total > inter.values.len() {
            " (display truncated)"
        } else {
            ""
        }
    );
    for value in &inter.values {
        println!("  {}", value);
    }

    Ok(())
}
