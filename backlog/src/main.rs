use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use backlog::calendar::{Clock, FixedClock, SystemClock};
use backlog::digest::{DigestBuilder, DigestOptions};
use backlog::graph::LogseqGraph;
use backlog::snapshot::Snapshot;
use backlog::storage::OutlineRepository;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "backlog",
    about = "Export a page outline with this week's linked journal blocks",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build the digest from a markdown graph directory.
    Graph(GraphArgs),

    /// Build the digest from a JSON snapshot of host payloads.
    Snapshot(SnapshotArgs),
}

#[derive(Debug, Args)]
struct GraphArgs {
    /// Graph root containing `pages/` and `journals/`.
    root: PathBuf,
    /// Name of the page to export.
    page: String,
    #[command(flatten)]
    digest: DigestArgs,
}

#[derive(Debug, Args)]
struct SnapshotArgs {
    /// Snapshot JSON file.
    file: PathBuf,
    /// Page to export. Defaults to the snapshot's page.
    #[arg(long)]
    page: Option<String>,
    #[command(flatten)]
    digest: DigestArgs,
}

#[derive(Debug, Args)]
struct DigestArgs {
    /// Date treated as today (YYYY-MM-DD). Defaults to the local date.
    #[arg(long)]
    today: Option<NaiveDate>,
    /// Write the digest to this path instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Line placed between the outline and the backlog section.
    #[arg(long, default_value = "----")]
    separator: String,
    /// Heading that opens the backlog section.
    #[arg(long, default_value = "## Backlog")]
    heading: String,
}

impl DigestArgs {
    fn options(&self) -> DigestOptions {
        DigestOptions {
            separator: self.separator.clone(),
            heading: self.heading.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Graph(args) => handle_graph(args),
        Commands::Snapshot(args) => handle_snapshot(args),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_graph(args: GraphArgs) -> Result<()> {
    let GraphArgs { root, page, digest } = args;
    let graph = LogseqGraph::load(&root).with_context(|| format!("loading graph {:?}", root))?;
    debug!(pages = graph.len(), "graph loaded");

    let text = build_digest(&graph, &page, &digest)?;
    emit(&text, digest.output.as_deref())
}

fn handle_snapshot(args: SnapshotArgs) -> Result<()> {
    let SnapshotArgs { file, page, digest } = args;
    let snapshot = Snapshot::load(&file)?;
    let page = page.unwrap_or_else(|| snapshot.page.clone());

    let text = build_digest(&snapshot, &page, &digest)?;
    emit(&text, digest.output.as_deref())
}

fn build_digest<R: OutlineRepository>(
    repository: R,
    page: &str,
    args: &DigestArgs,
) -> Result<String> {
    let today = args.today.unwrap_or_else(|| SystemClock.today());
    DigestBuilder::new(repository, FixedClock(today))
        .with_options(args.options())
        .build(page)
}

fn emit(text: &str, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text.as_bytes()).with_context(|| format!("writing {:?}", path))?;
            println!("Wrote digest to {:?}", path);
        }
        None => print!("{text}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn digest_args(today: &str) -> DigestArgs {
        DigestArgs {
            today: Some(today.parse().expect("date")),
            output: None,
            separator: "----".into(),
            heading: "## Backlog".into(),
        }
    }

    fn write(root: &Path, rel: &str, text: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, text).expect("write");
    }

    #[test]
    fn graph_digest_matches_expected_document() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(root, "pages/Page.md", "- A\n- B\n\t- B1\n");
        write(root, "journals/2024_01_02.md", "- Task #[[Page]]\n");
        write(root, "journals/2023_12_29.md", "- last week [[Page]]\n");

        let graph = LogseqGraph::load(root).expect("load graph");
        let text = build_digest(&graph, "Page", &digest_args("2024-01-03")).expect("digest");

        assert_eq!(
            text,
            "- A\n- B\n  - B1\n----\n## Backlog\n**January 2, 2024**\n- Task\n"
        );
    }

    #[test]
    fn graph_digest_cleans_links_when_page_case_differs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        write(root, "pages/Project.md", "- A\n");
        write(root, "journals/2024_01_02.md", "- Task #[[Project]]\n");

        let graph = LogseqGraph::load(root).expect("load graph");
        let text = build_digest(&graph, "project", &digest_args("2024-01-03")).expect("digest");

        assert_eq!(text, "- A\n----\n## Backlog\n**January 2, 2024**\n- Task\n");
    }

    #[test]
    fn snapshot_digest_uses_custom_heading() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("snapshot.json");
        fs::write(
            &path,
            r#"{
  "page": "Page",
  "outline": [{ "content": "A" }],
  "related": [[{ "originalName": "January 2nd, 2024", "journalDay": 20240102 },
               [{ "content": "[[Page]] follow up" }]]]
}"#,
        )
        .expect("write snapshot");

        let snapshot = Snapshot::load(&path).expect("load snapshot");
        let mut args = digest_args("2024-01-07");
        args.heading = "## This week".into();

        let text = build_digest(&snapshot, "Page", &args).expect("digest");
        assert_eq!(
            text,
            "- A\n----\n## This week\n**January 2, 2024**\n- follow up\n"
        );
    }

    #[test]
    fn snapshot_digest_accepts_page_in_any_case() {
        let snapshot: Snapshot = Snapshot::from_json_str(
            r#"{
  "page": "Page",
  "outline": [{ "content": "A" }],
  "related": [[{ "originalName": "January 2nd, 2024", "journalDay": 20240102 },
               [{ "content": "Task #[[Page]]" }]]]
}"#,
        )
        .expect("parse snapshot");

        let text = build_digest(&snapshot, "PAGE", &digest_args("2024-01-03")).expect("digest");
        assert_eq!(text, "- A\n----\n## Backlog\n**January 2, 2024**\n- Task\n");
    }

    #[test]
    fn unknown_page_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let graph = LogseqGraph::load(tmp.path()).expect("load graph");
        let err = build_digest(&graph, "Nope", &digest_args("2024-01-03")).expect_err("missing");
        assert!(format!("{err:#}").contains("page \"Nope\" not found"));
    }

    #[test]
    fn emit_writes_output_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("digest.md");
        emit("- A\n", Some(path.as_path())).expect("emit");
        assert_eq!(fs::read_to_string(&path).expect("read"), "- A\n");
    }

    #[test]
    fn cli_parses_graph_arguments() {
        let cli = Cli::try_parse_from([
            "backlog",
            "--verbose",
            "graph",
            "/tmp/graph",
            "Project",
            "--today",
            "2024-01-03",
        ])
        .expect("parse");
        assert!(cli.verbose);
        match cli.command {
            Commands::Graph(args) => {
                assert_eq!(args.page, "Project");
                assert_eq!(args.digest.separator, "----");
                assert_eq!(args.digest.today, NaiveDate::from_ymd_opt(2024, 1, 3));
            }
            other => panic!("expected graph command, got {:?}", other),
        }
    }
}
