//! engram — cognitive memory engine for AI agents.
//! add / recall / search / link / session / sleep over a local SQLite file.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use engram::ai::{self, Embedder};
use engram::consolidate::{
    self, run_consolidation, should_consolidate, ConsolidateOptions,
};
use engram::db::{LinkRelation, LinkWriteMode, MemoryDB, MemoryType};
use engram::error::EngramError;
use engram::export::{export, ExportFormat};
use engram::recall::{format_recall, recall, RecallOptions};
use engram::search::{
    search_hybrid, search_lexical, search_semantic, HybridOptions, SearchHit, SemanticOptions,
};
use engram::thresholds::PERMANENT_TAG;
use engram::util::parse_since;
use engram::write::{add, ingest, update, AddInput, UpdateInput};

#[derive(Parser)]
#[command(name = "engram", version, about = "Cognitive memory engine for AI agents")]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, default_value = "data/engram.db", env = "ENGRAM_DB")]
    db: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Store a memory
    Add {
        /// Memory type (reflex|episode|fact|preference|decision|session_summary)
        mem_type: String,
        title: String,
        /// Memory body
        #[arg(short, long, default_value = "")]
        content: String,
        /// Comma-separated tags
        #[arg(short, long)]
        tags: Option<String>,
        /// Importance prior in 0..=1
        #[arg(short, long)]
        importance: Option<f64>,
        /// Tag the memory permanent (exempt from decay and prune)
        #[arg(long)]
        permanent: bool,
        /// Skip automatic linking to semantic neighbours
        #[arg(long)]
        no_auto_link: bool,
        /// Source conversation id
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Batch-add memories from a JSON array (inline or -f file)
    Ingest {
        /// Inline JSON
        json: Option<String>,
        /// Read the JSON array from a file
        #[arg(short, long)]
        file: Option<String>,
        /// Delete the file afterwards — only when every item succeeded
        #[arg(long)]
        remove_file: bool,
    },
    /// Assemble task-relevant context inside a token budget
    Recall {
        query: String,
        /// Token budget
        #[arg(short, long, default_value_t = 4000)]
        budget: usize,
        /// Restrict to one memory type
        #[arg(short = 't', long)]
        mem_type: Option<String>,
        /// Session whose summary to prepend
        #[arg(short, long)]
        session: Option<String>,
        /// Result count ceiling
        #[arg(short, long, default_value_t = 10)]
        k: usize,
        /// Titles only
        #[arg(long)]
        short: bool,
    },
    /// Raw search without context assembly
    Search {
        query: String,
        /// hybrid | semantic | fts
        #[arg(short, long, default_value = "hybrid")]
        mode: String,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
        #[arg(short = 't', long)]
        mem_type: Option<String>,
        /// Cross-encoder rerank (hybrid only)
        #[arg(long)]
        rerank: bool,
        /// Only memories created in the window, e.g. 12h, 7d, 2w, 1m
        #[arg(long)]
        since: Option<String>,
        /// Graph expansion depth
        #[arg(long, default_value_t = 0)]
        hops: usize,
    },
    /// Show one memory
    Get { id: i64 },
    /// Patch title/content/importance; re-embeds on text change
    Update {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        content: Option<String>,
        #[arg(short, long)]
        importance: Option<f64>,
    },
    /// Hard-delete a memory (tags, links, access log cascade)
    Delete { id: i64 },
    /// Link two memories
    Link {
        source: i64,
        target: i64,
        /// related_to|caused_by|evolved_from|contradicts|supersedes
        #[arg(short, long, default_value = "related_to")]
        relation: String,
    },
    /// Tag operations
    Tag {
        #[command(subcommand)]
        cmd: TagCmd,
    },
    /// Toggle the permanent tag
    Mark {
        id: i64,
        /// Remove the permanent tag instead of adding it
        #[arg(long)]
        remove: bool,
    },
    /// Session tracking
    Session {
        #[command(subcommand)]
        cmd: SessionCmd,
    },
    /// Run a consolidation cycle: decay, prune, merge, boost
    Sleep {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        decay_rate: Option<f64>,
        /// Prune threshold override
        #[arg(long)]
        prune: Option<f64>,
        /// Merge similarity override
        #[arg(long)]
        merge: Option<f64>,
    },
    /// Store counters
    Stats {
        /// Top tags to list
        #[arg(short = 'n', long, default_value_t = 10)]
        top: usize,
    },
    /// Index health and near-duplicate report
    Diagnostics {
        /// Max duplicate pairs to report
        #[arg(short = 'n', long, default_value_t = 10)]
        top: usize,
        #[arg(long, default_value_t = 0.85)]
        dup_threshold: f64,
    },
    /// Dump the store
    Export {
        /// json | md
        #[arg(short, long, default_value = "json")]
        format: String,
        /// Output path (stdout when omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
enum TagCmd {
    /// Add tags to a memory
    Add { id: i64, tags: String },
    /// Remove one tag from a memory
    Remove { id: i64, tag: String },
    /// List all tags with usage counts
    List,
}

#[derive(Subcommand)]
enum SessionCmd {
    /// Start (or restart) a session
    Start {
        /// Session id; generated when omitted
        id: Option<String>,
        #[arg(short, long)]
        title: Option<String>,
    },
    /// End a session, optionally storing an embedded summary
    End {
        id: String,
        #[arg(short, long)]
        summary: Option<String>,
        /// Run a sleep cycle afterwards when one is due
        #[arg(long)]
        auto_consolidate: bool,
    },
    /// List sessions, newest first
    List {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        since: Option<String>,
    },
    /// Show a session and the memories it touched
    Show { id: String },
}

fn parse_tags(raw: Option<String>) -> Vec<String> {
    raw.map(|s| s.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect())
        .unwrap_or_default()
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("serialize: {e}"),
    }
}

fn print_hits(hits: &[SearchHit]) {
    for h in hits {
        println!(
            "{:>6.3}  #{:<5} [{}] {}",
            h.score,
            h.memory.id,
            h.memory.mem_type,
            engram::util::truncate_chars(&h.memory.title, 72)
        );
    }
    if hits.is_empty() {
        println!("no results");
    }
}

#[tokio::main]
async fn main() {
    let filter = if std::env::var("ENGRAM_TRACE").map(|v| v == "1").unwrap_or(false) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(if e.is_invalid_argument() { 2 } else { 1 });
    }
}

async fn run(cli: Cli) -> Result<(), EngramError> {
    let db = MemoryDB::open(&cli.db)?;

    match cli.cmd {
        Cmd::Add {
            mem_type,
            title,
            content,
            tags,
            importance,
            permanent,
            no_auto_link,
            conversation,
        } => {
            let mem_type: MemoryType = mem_type.parse()?;
            let input = AddInput {
                mem_type,
                title,
                content,
                importance,
                tags: parse_tags(tags),
                links: vec![],
                source_conversation_id: conversation,
                permanent: permanent || mem_type.default_permanent(),
                auto_link: !no_auto_link,
            };
            let outcome = add(&db, ai::service()?.as_ref(), input).await?;
            print_json(&outcome);
        }

        Cmd::Ingest { json, file, remove_file } => {
            let raw = match (&json, &file) {
                (Some(j), _) => j.clone(),
                (None, Some(f)) => std::fs::read_to_string(f)
                    .map_err(|e| EngramError::Validation(format!("read {f}: {e}")))?,
                (None, None) => {
                    return Err(EngramError::Validation("provide inline JSON or -f file".into()))
                }
            };
            let items: Vec<AddInput> = serde_json::from_str(&raw)
                .map_err(|e| EngramError::Validation(format!("parse ingest JSON: {e}")))?;
            let report = ingest(&db, ai::service()?.as_ref(), items).await?;
            print_json(&report);
            if !report.all_ok() {
                return Err(EngramError::Validation(format!(
                    "{} of {} items failed",
                    report.failures.len(),
                    report.created + report.duplicates + report.merged + report.failures.len()
                )));
            }
            if remove_file {
                if let Some(f) = file {
                    std::fs::remove_file(&f)
                        .map_err(|e| EngramError::Internal(format!("remove {f}: {e}")))?;
                }
            }
        }

        Cmd::Recall { query, budget, mem_type, session, k, short } => {
            let opts = RecallOptions {
                k,
                budget,
                mem_type: mem_type.map(|t| t.parse()).transpose()?,
                session_id: session,
            };
            let result = recall(&db, ai::service()?.as_ref(), &query, &opts).await?;
            println!("{}", format_recall(&result, short));
        }

        Cmd::Search { query, mode, k, mem_type, rerank, since, hops } => {
            let mem_type = mem_type.map(|t| t.parse()).transpose()?;
            let since = since.map(|s| parse_since(&s)).transpose()?;
            match mode.as_str() {
                "semantic" => {
                    let opts =
                        SemanticOptions { k, mem_type, since, include_archived: false };
                    let hits =
                        search_semantic(&db, ai::service()?.as_ref(), &query, &opts).await?;
                    print_hits(&hits);
                }
                "fts" => {
                    let hits = search_lexical(&db, &query, k, mem_type, since)?;
                    print_hits(&hits);
                }
                "hybrid" => {
                    let opts = HybridOptions {
                        k,
                        mem_type,
                        since,
                        rerank,
                        hops,
                        ..Default::default()
                    };
                    let hits = search_hybrid(&db, ai::service()?.as_ref(), &query, &opts).await?;
                    print_hits(&hits);
                }
                other => {
                    return Err(EngramError::Validation(format!(
                        "invalid search mode: {other} (expected hybrid|semantic|fts)"
                    )))
                }
            }
        }

        Cmd::Get { id } => match db.get(id)? {
            Some(mut mem) => {
                mem.embedding = None;
                print_json(&mem);
                let links = db.links_of(id)?;
                if !links.is_empty() {
                    print_json(&links);
                }
            }
            None => return Err(EngramError::NotFound),
        },

        Cmd::Update { id, title, content, importance } => {
            let ok = update(
                &db,
                ai::service()?.as_ref(),
                id,
                UpdateInput { title, content, importance },
            )
            .await?;
            if !ok {
                return Err(EngramError::NotFound);
            }
            println!("updated #{id}");
        }

        Cmd::Delete { id } => {
            if !db.delete(id)? {
                return Err(EngramError::NotFound);
            }
            println!("deleted #{id}");
        }

        Cmd::Link { source, target, relation } => {
            let relation: LinkRelation = relation.parse()?;
            if db.get(source)?.is_none() || db.get(target)?.is_none() {
                return Err(EngramError::NotFound);
            }
            db.insert_link(source, target, relation, 0.5, LinkWriteMode::Replace)?;
            println!("linked #{source} —{relation}→ #{target}");
        }

        Cmd::Tag { cmd } => match cmd {
            TagCmd::Add { id, tags } => {
                if db.get(id)?.is_none() {
                    return Err(EngramError::NotFound);
                }
                db.add_tags(id, &parse_tags(Some(tags)))?;
                println!("tags: {}", db.tags_for(id)?.join(", "));
            }
            TagCmd::Remove { id, tag } => {
                if !db.remove_tag(id, &tag)? {
                    return Err(EngramError::NotFound);
                }
                println!("removed '{tag}' from #{id}");
            }
            TagCmd::List => {
                for tc in db.list_tag_counts()? {
                    println!("{:>5}  {}", tc.count, tc.name);
                }
            }
        },

        Cmd::Mark { id, remove } => {
            if db.get(id)?.is_none() {
                return Err(EngramError::NotFound);
            }
            if remove {
                db.remove_tag(id, PERMANENT_TAG)?;
                println!("#{id} is no longer permanent");
            } else {
                db.add_tags(id, &[PERMANENT_TAG.to_string()])?;
                println!("#{id} marked permanent");
            }
        }

        Cmd::Session { cmd } => match cmd {
            SessionCmd::Start { id, title } => {
                let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let session = db.start_session(&id, title.as_deref())?;
                print_json(&session);
            }
            SessionCmd::End { id, summary, auto_consolidate } => {
                let embedding = match summary.as_deref() {
                    Some(text) => Some(ai::service()?.embed(text).await?),
                    None => None,
                };
                if !db.end_session(&id, summary.as_deref(), embedding.as_deref())? {
                    return Err(EngramError::NotFound);
                }
                println!("session {id} ended");
                if auto_consolidate && should_consolidate(&db, consolidate::default_interval_days())
                {
                    let report = run_consolidation(
                        &db,
                        ai::service()?.as_ref(),
                        &ConsolidateOptions::default(),
                    )
                    .await?;
                    print_json(&report);
                }
            }
            SessionCmd::List { limit, since } => {
                let since = since.map(|s| parse_since(&s)).transpose()?;
                let sessions = db.list_sessions(since, None, limit)?;
                print_json(&sessions);
            }
            SessionCmd::Show { id } => match db.session_context(&id)? {
                Some(ctx) => print_json(&ctx),
                None => return Err(EngramError::NotFound),
            },
        },

        Cmd::Sleep { dry_run, decay_rate, prune, merge } => {
            let mut opts = ConsolidateOptions { dry_run, ..Default::default() };
            if let Some(r) = decay_rate {
                opts.decay_rate = r;
            }
            if let Some(p) = prune {
                opts.prune_threshold = p;
            }
            if let Some(m) = merge {
                opts.merge_threshold = m;
            }
            let report = run_consolidation(&db, ai::service()?.as_ref(), &opts).await?;
            print_json(&report);
        }

        Cmd::Stats { top } => {
            let stats = db.stats()?;
            print_json(&stats);
            let tags = db.list_tag_counts()?;
            for tc in tags.iter().take(top) {
                println!("{:>5}  {}", tc.count, tc.name);
            }
        }

        Cmd::Diagnostics { top, dup_threshold } => {
            let (fts_rows, mem_rows) = db.fts_counts();
            println!("fts rows: {fts_rows} / memories: {mem_rows}");
            println!("vector fallback: {}", db.brute_force_fallback());
            let all = db.all_with_embeddings()?;
            let mut pairs: Vec<(i64, i64, f64)> = Vec::new();
            for i in 0..all.len() {
                for j in (i + 1)..all.len() {
                    let sim = ai::cosine(&all[i].1, &all[j].1).unwrap_or(0.0);
                    if sim >= dup_threshold {
                        pairs.push((all[i].0.id, all[j].0.id, sim));
                    }
                }
            }
            pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
            println!("near-duplicate pairs (≥ {dup_threshold}): {}", pairs.len());
            for (a, b, sim) in pairs.iter().take(top) {
                println!("  #{a} ~ #{b}  {sim:.3}");
            }
        }

        Cmd::Export { format, output } => {
            let format: ExportFormat = format.parse()?;
            let dump = export(&db, format)?;
            match output {
                Some(path) => std::fs::write(&path, dump)
                    .map_err(|e| EngramError::Internal(format!("write {path}: {e}")))?,
                None => println!("{dump}"),
            }
        }
    }
    Ok(())
}
