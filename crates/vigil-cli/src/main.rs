use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vigil_core::config::Config;
use vigil_core::recognizer::FACE_NAMESPACE;
use vigil_core::rule::RuleSet;
use vigil_core::Person;
use vigil_store::Entry;

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil face identity store administration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known persons
    List,
    /// Show a person record as JSON
    Show {
        /// Person ID
        id: String,
    },
    /// Give a person a name
    Rename {
        /// Person ID
        id: String,
        /// New display name
        name: String,
    },
    /// Remove a person and their stored face crops
    Remove {
        /// Person ID
        id: String,
    },
    /// Copy a person's face crops into a directory
    Export {
        /// Person ID
        id: String,
        /// Destination directory (created if missing)
        dir: PathBuf,
    },
    /// Validate and print a rules file
    Rules {
        /// Rules file (defaults to VIGIL_RULES_PATH)
        path: Option<PathBuf>,
    },
    /// Show configuration and store statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::List => {
            let persons = vigil_core::open_persons(&config);
            if persons.is_empty() {
                println!("No persons stored");
            }
            for person in persons.get_all_sorted().iter().rev() {
                println!(
                    "{:<36}  {:<16}  images={:<2}  updated={}",
                    person.entry_id().unwrap_or("-"),
                    person.name().unwrap_or("(unnamed)"),
                    person.face().len(),
                    format_stamp(person.updated_at()),
                );
            }
        }
        Commands::Show { id } => {
            let persons = vigil_core::open_persons(&config);
            let person = persons.get(&id).with_context(|| format!("no person {id}"))?;
            println!("{}", serde_json::to_string_pretty(&person)?);
        }
        Commands::Rename { id, name } => {
            let persons = vigil_core::open_persons(&config);
            persons
                .update_with(&id, None, |person| person.set_name(Some(name.clone())))
                .with_context(|| format!("cannot rename {id}"))?;
            persons.flush().await;
            println!("Renamed {id} to {name}");
        }
        Commands::Remove { id } => {
            let persons = vigil_core::open_persons(&config);
            let storage = vigil_core::open_storage(&config);
            let person = persons
                .remove(&id, None)
                .with_context(|| format!("cannot remove {id}"))?;
            persons.flush().await;

            let mut deleted = 0;
            for file_name in person.face().file_names() {
                if storage.delete(FACE_NAMESPACE, &file_name).await? {
                    deleted += 1;
                }
            }
            println!("Removed {id} ({deleted} face crops deleted)");
        }
        Commands::Export { id, dir } => {
            let persons = vigil_core::open_persons(&config);
            let storage = vigil_core::open_storage(&config);
            let person = persons.get(&id).with_context(|| format!("no person {id}"))?;
            export(&person, &storage, &dir).await?;
        }
        Commands::Rules { path } => {
            let Some(path) = path.or(config.rules_path.clone()) else {
                bail!("no rules file given and VIGIL_RULES_PATH is unset");
            };
            let rules = RuleSet::load(&path)?;
            if rules.is_empty() {
                println!("{}: no rules", path.display());
            }
            for rule in &rules.rules {
                let subject = match rule.unknown {
                    Some(true) => "unknown",
                    Some(false) => "known",
                    None => "any",
                };
                println!(
                    "{:<20}  {subject:<7}  count {:?} {}",
                    rule.name, rule.count.op, rule.count.value
                );
            }
        }
        Commands::Status => {
            let persons = vigil_core::open_persons(&config);
            let images: usize = persons.get_all().iter().map(|p| p.face().len()).sum();

            println!("data dir:      {}", config.data_dir.display());
            println!("persons file:  {}", config.persons_file.display());
            println!("blob dir:      {}", config.blob_dir.display());
            println!("tolerance:     {}", config.tolerance);
            match config.max_persons {
                Some(max) => println!("persons:       {} / {max}", persons.len()),
                None => println!("persons:       {} (unbounded)", persons.len()),
            }
            println!("face images:   {images}");
            match &config.rules_path {
                Some(path) => println!("rules:         {}", path.display()),
                None => println!("rules:         (none)"),
            }
        }
    }

    Ok(())
}

async fn export(person: &Person, storage: &vigil_store::FsStorage, dir: &std::path::Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("cannot create {}", dir.display()))?;

    let mut exported = 0;
    for image in person.face().images().iter().rev() {
        match storage.get(FACE_NAMESPACE, image.file_name()).await {
            Ok(bytes) => {
                let target = dir.join(format!("{}.jpg", image.file_name()));
                tokio::fs::write(&target, bytes)
                    .await
                    .with_context(|| format!("cannot write {}", target.display()))?;
                println!("{}  similarity={:.3}", target.display(), image.similarity());
                exported += 1;
            }
            Err(e) => tracing::warn!(file = image.file_name(), error = %e, "face crop missing"),
        }
    }

    println!("Exported {exported} of {} face crops", person.face().len());
    Ok(())
}

fn format_stamp(stamp: Option<i64>) -> String {
    stamp
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
