use crate::config::{load_mapping, CatalogConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shelfkeep_store::{
    Catalog, ChunkedStore, DirectoryBackup, DuplicateResolver, FieldMapping, FileKvStore, Record,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shelfkeep")]
#[command(about = "Local book and member catalog manager", long_about = None)]
pub struct Cli {
    #[arg(short, long, env = "SHELFKEEP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Overrides data_path from the config file
    #[arg(short, long, env = "SHELFKEEP_DATA")]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Add {
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Extra field as name=value, repeatable
        #[arg(short, long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    List {
        query: Option<String>,
    },
    Show {
        id: String,
    },
    Remove {
        id: String,
    },
    Import {
        file: PathBuf,
        #[arg(long)]
        mapping: Option<PathBuf>,
        #[arg(long)]
        replace: bool,
    },
    Export {
        /// Output file; stdout when omitted
        file: Option<PathBuf>,
        #[arg(long)]
        mapping: Option<PathBuf>,
    },
    Dedupe {
        /// Field to compare, repeatable; config default_fields when omitted
        #[arg(short, long = "field")]
        fields: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
    Stats,
    Info,
    Backup {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    Restore {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    Cleanup,
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_lowercase(), value.trim().to_string()))
        }
        _ => Err(format!("expected name=value, got {s:?}")),
    }
}

impl Cli {
    pub fn load_config(&self) -> Result<CatalogConfig> {
        let mut config = match &self.config {
            Some(path) => CatalogConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => CatalogConfig::default(),
        };
        if let Some(data) = &self.data {
            config.data_path = data.clone();
        }
        Ok(config)
    }

    fn store(config: &CatalogConfig) -> Result<ChunkedStore<FileKvStore>> {
        let mut medium = FileKvStore::open(&config.data_path)
            .with_context(|| format!("opening {}", config.data_path.display()))?;
        if let Some(limit) = config.value_limit {
            medium = medium.with_value_limit(limit);
        }
        Ok(ChunkedStore::new(medium, config.store.clone())?)
    }

    fn open(config: &CatalogConfig) -> Result<Catalog<FileKvStore>> {
        let store = Self::store(config)?;
        Ok(Catalog::open(store, DuplicateResolver::new(&config.dedupe))?)
    }

    fn mapping(config: &CatalogConfig, path: &Option<PathBuf>) -> Result<FieldMapping> {
        match path {
            Some(p) => load_mapping(p).with_context(|| format!("loading mapping {}", p.display())),
            None => Ok(config.mapping.clone()),
        }
    }

    fn backup_target(config: &CatalogConfig, dir: &Option<PathBuf>) -> Result<DirectoryBackup> {
        match dir.as_ref().or(config.backup_dir.as_ref()) {
            Some(d) => Ok(DirectoryBackup::new(d)),
            None => anyhow::bail!("No backup directory: pass --dir or set backup_dir"),
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut out = std::io::stdout().lock();
        self.run_to(&mut out).await
    }

    /// Run the command against the configured data file, writing to `out`.
    pub async fn run_to<W: Write>(&self, out: &mut W) -> Result<()> {
        let config = self.load_config()?;
        match &self.command {
            // Info and cleanup never load the records, so they still work
            // on a store whose chunks no longer reassemble.
            Command::Info | Command::Cleanup => {
                let store = Self::store(&config)?;
                self.execute_store(&store, out)
            }
            _ => {
                let mut catalog = Self::open(&config)?;
                self.execute(&config, &mut catalog, out).await
            }
        }
    }

    fn execute_store<W: Write>(
        &self,
        store: &ChunkedStore<FileKvStore>,
        out: &mut W,
    ) -> Result<()> {
        match &self.command {
            Command::Info => match store.index()? {
                Some(index) => writeln!(out, "{}", serde_json::to_string_pretty(&index)?)?,
                None => writeln!(out, "Nothing stored yet")?,
            },
            Command::Cleanup => {
                let removed = store.cleanup()?;
                writeln!(out, "Removed {removed} chunk(s)")?;
            }
            _ => anyhow::bail!("command needs an open catalog"),
        }
        Ok(())
    }

    pub async fn execute<W: Write>(
        &self,
        config: &CatalogConfig,
        catalog: &mut Catalog<FileKvStore>,
        out: &mut W,
    ) -> Result<()> {
        match &self.command {
            Command::Add {
                title,
                author,
                category,
                fields,
            } => {
                let mut record = Record::new();
                for (name, value) in [("title", title), ("author", author), ("category", category)] {
                    if let Some(v) = value {
                        record.set(name, v.as_str());
                    }
                }
                for (name, value) in fields {
                    record.set(name.clone(), value.as_str());
                }
                let id = catalog.add(record)?;
                writeln!(out, "{id}")?;
            }
            Command::List { query } => {
                let records = catalog.search(query.as_deref().unwrap_or(""));
                writeln!(
                    out,
                    "{:<38} {:<32} {:<24} {:<16}",
                    "ID", "TITLE", "AUTHOR", "CATEGORY"
                )?;
                writeln!(out, "{}", "-".repeat(113))?;
                for r in &records {
                    writeln!(
                        out,
                        "{:<38} {:<32} {:<24} {:<16}",
                        r.id,
                        truncate(&r.text("title"), 32),
                        truncate(&r.text("author"), 24),
                        truncate(&r.text("category"), 16)
                    )?;
                }
                writeln!(out, "{} record(s)", records.len())?;
            }
            Command::Show { id } => {
                let record = catalog
                    .get(id)
                    .with_context(|| format!("No record with id {id}"))?;
                writeln!(out, "{}", serde_json::to_string_pretty(record)?)?;
            }
            Command::Remove { id } => {
                catalog.remove(id)?;
                writeln!(out, "Removed {id}")?;
            }
            Command::Import {
                file,
                mapping,
                replace,
            } => {
                let mapping = Self::mapping(config, mapping)?;
                let reader = BufReader::new(
                    File::open(file).with_context(|| format!("opening {}", file.display()))?,
                );
                let count = catalog.import_csv(reader, &mapping, *replace)?;
                writeln!(out, "Imported {count} record(s); catalog holds {}", catalog.len())?;
            }
            Command::Export { file, mapping } => {
                let mapping = Self::mapping(config, mapping)?;
                match file {
                    Some(path) => {
                        let writer = BufWriter::new(File::create(path)?);
                        catalog.export_csv(writer, &mapping)?;
                        writeln!(
                            out,
                            "Exported {} record(s) to {}",
                            catalog.len(),
                            path.display()
                        )?;
                    }
                    None => catalog.export_csv(&mut *out, &mapping)?,
                }
            }
            Command::Dedupe { fields, dry_run } => {
                let fields = if fields.is_empty() {
                    config.dedupe.default_fields.clone()
                } else {
                    fields.clone()
                };
                let groups = if *dry_run {
                    catalog.preview_duplicates(&fields)?
                } else {
                    catalog.dedupe(&fields)?.groups
                };
                for group in &groups {
                    writeln!(
                        out,
                        "keep {} drop {} [{}]",
                        group.kept,
                        group.removed.join(", "),
                        group.key.join(" | ")
                    )?;
                }
                let removed: usize = groups.iter().map(|g| g.removed.len()).sum();
                if *dry_run {
                    writeln!(out, "{removed} duplicate(s) found (dry run)")?;
                } else {
                    writeln!(out, "Removed {removed} duplicate(s)")?;
                }
            }
            Command::Stats => {
                writeln!(out, "{}", serde_json::to_string_pretty(&catalog.stats())?)?;
            }
            Command::Info => match catalog.index()? {
                Some(index) => writeln!(out, "{}", serde_json::to_string_pretty(&index)?)?,
                None => writeln!(out, "Nothing stored yet")?,
            },
            Command::Backup { dir } => {
                let target = Self::backup_target(config, dir)?;
                if catalog.backup_to(&target).await? {
                    writeln!(
                        out,
                        "Backed up {} record(s) to {}",
                        catalog.len(),
                        target.snapshot_path().display()
                    )?;
                } else {
                    writeln!(out, "Backup already up to date")?;
                }
            }
            Command::Restore { dir } => {
                let target = Self::backup_target(config, dir)?;
                let count = catalog.restore_from(&target).await?;
                writeln!(out, "Restored {count} record(s)")?;
            }
            Command::Cleanup => {
                let removed = catalog.clear()?;
                writeln!(out, "Removed {removed} chunk(s)")?;
            }
        }
        Ok(())
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let mut t: String = s.chars().take(width.saturating_sub(1)).collect();
        t.push('…');
        t
    }
}
