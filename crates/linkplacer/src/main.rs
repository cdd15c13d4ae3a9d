use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use linkplacer_core::audit::{self, DEFAULT_LOG_LIMIT};
use linkplacer_core::config::{ToolConfig, ToolConfigPatch, load_config, patch_config};
use linkplacer_core::migrate::{pending_migration_count, run_migrations, schema_version};
use linkplacer_core::rebuild::{
    RebuildOptions, RebuildReport, rebuild, staleness, unassigned_matches_for_link,
};
use linkplacer_core::render::render_links_for_page;
use linkplacer_core::rules::{Link, Rule, RuleMatch};
use linkplacer_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_initialized, init_layout, inspect_runtime, resolve_paths,
};
use linkplacer_core::store::{self, StoreStats};
use linkplacer_core::sync::{PurgeReport, SyncOptions, last_sync_info, purge_wiki_pages, sync};

#[derive(Debug, Parser)]
#[command(
    name = "linkplacer",
    version,
    about = "Rule-driven placement of service links on wiki pages"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Config(ConfigArgs),
    Sync(SyncArgs),
    Link(LinkArgs),
    Rule(RuleArgs),
    Rebuild(RebuildArgs),
    Page(PageArgs),
    Log(LogArgs),
    Db(DbArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config.toml")]
    force: bool,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    #[arg(long, value_name = "URL", help = "MediaWiki api.php endpoint")]
    api_url: Option<String>,
    #[arg(long, value_name = "URL", help = "Public site base URL for tracked links")]
    server: Option<String>,
    #[arg(long, value_name = "CODE", help = "Site content language")]
    language: Option<String>,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(
        long,
        value_name = "PATH",
        help = "Import a JSON snapshot instead of calling the wiki"
    )]
    from_file: Option<PathBuf>,
    #[arg(long, help = "Skip the assignment rebuild after the mirror refresh")]
    no_rebuild: bool,
    #[arg(long, help = "Print the sync report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct LinkArgs {
    #[command(subcommand)]
    command: LinkSubcommand,
}

#[derive(Debug, Subcommand)]
enum LinkSubcommand {
    Add(LinkAddArgs),
    Edit(LinkEditArgs),
    Show { link_id: i64 },
    List,
    Delete { link_id: i64 },
}

#[derive(Debug, Args)]
struct LinkAddArgs {
    url: String,
    text: String,
}

#[derive(Debug, Args)]
struct LinkEditArgs {
    link_id: i64,
    #[arg(long, value_name = "URL")]
    url: Option<String>,
    #[arg(long, value_name = "TEXT")]
    text: Option<String>,
}

#[derive(Debug, Args)]
struct RuleArgs {
    #[command(subcommand)]
    command: RuleSubcommand,
}

#[derive(Debug, Subcommand)]
enum RuleSubcommand {
    #[command(name = "add-page")]
    AddPage(RuleAddPageArgs),
    #[command(name = "add-category")]
    AddCategory(RuleAddCategoryArgs),
    Delete { rule_id: i64 },
    List,
}

#[derive(Debug, Args)]
struct RuleAddPageArgs {
    link_id: i64,
    #[arg(value_name = "PAGE", help = "Mirrored page id or title")]
    page: String,
    #[arg(long, help = "Only place when the page has no regular match")]
    fallback: bool,
}

#[derive(Debug, Args)]
struct RuleAddCategoryArgs {
    link_id: i64,
    #[arg(long, value_name = "NAME")]
    content_area: Option<String>,
    #[arg(
        long = "category",
        value_name = "NAME",
        help = "Repeat for up to four categories"
    )]
    categories: Vec<String>,
    #[arg(long, help = "Only place when the page has no regular match")]
    fallback: bool,
}

#[derive(Debug, Args)]
struct RebuildArgs {
    #[arg(long, help = "Report would-be changes without writing")]
    dry_run: bool,
    #[arg(long, help = "Print the rebuild report as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct PageArgs {
    #[command(subcommand)]
    command: PageSubcommand,
}

#[derive(Debug, Subcommand)]
enum PageSubcommand {
    Links(PageLinksArgs),
}

#[derive(Debug, Args)]
struct PageLinksArgs {
    #[arg(value_name = "PAGE", help = "Mirrored page id or title")]
    page: String,
    #[arg(long, help = "Print the rendered links as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct LogArgs {
    #[arg(long, value_name = "ID", help = "Only entries touching one link")]
    link: Option<i64>,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
    #[arg(long, help = "Print entries as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Config(ConfigArgs { command })) => match command {
            ConfigSubcommand::Set(args) => run_config_set(&runtime, args),
        },
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::Link(LinkArgs { command })) => match command {
            LinkSubcommand::Add(args) => run_link_add(&runtime, args),
            LinkSubcommand::Edit(args) => run_link_edit(&runtime, args),
            LinkSubcommand::Show { link_id } => run_link_show(&runtime, link_id),
            LinkSubcommand::List => run_link_list(&runtime),
            LinkSubcommand::Delete { link_id } => run_link_delete(&runtime, link_id),
        },
        Some(Commands::Rule(RuleArgs { command })) => match command {
            RuleSubcommand::AddPage(args) => run_rule_add_page(&runtime, args),
            RuleSubcommand::AddCategory(args) => run_rule_add_category(&runtime, args),
            RuleSubcommand::Delete { rule_id } => run_rule_delete(&runtime, rule_id),
            RuleSubcommand::List => run_rule_list(&runtime),
        },
        Some(Commands::Rebuild(args)) => run_rebuild(&runtime, args),
        Some(Commands::Page(PageArgs { command })) => match command {
            PageSubcommand::Links(args) => run_page_links(&runtime, args),
        },
        Some(Commands::Log(args)) => run_log(&runtime, args),
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: true,
            force: args.force,
        },
    )?;
    let migration = run_migrations(&paths)?;

    println!("Initialized linkplacer runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", format_flag(report.wrote_config));
    println!("migrations_applied: {}", migration.applied.len());
    println!("schema_version: {}", migration.current_version);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths);

    println!("runtime status");
    println!(
        "project_root: {} ({})",
        normalize_path(&paths.project_root),
        paths.root_source.as_str()
    );
    println!(
        "data_dir: {} ({})",
        normalize_path(&paths.data_dir),
        paths.data_source.as_str()
    );
    println!(
        "config_path: {} ({})",
        normalize_path(&paths.config_path),
        paths.config_source.as_str()
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );

    if status.db_exists {
        println!("schema_version: {}", schema_version(&paths)?);
        let pending = pending_migration_count(&paths)?;
        if pending > 0 {
            println!("pending_migrations: {pending}");
        } else {
            let config = load_config(&paths.config_path)?;
            print_stats("store", &store::stats(&paths)?);
            match last_sync_info(&paths)? {
                Some(info) => {
                    println!("last_sync_unix: {}", info.synced_at_unix);
                    println!(
                        "last_sync_source: {}",
                        info.source.as_deref().unwrap_or("<unknown>")
                    );
                }
                None => println!("last_sync: <never>"),
            }
            let freshness = staleness(&paths, &config)?;
            println!("assignments_stale: {}", format_flag(freshness.stale));
            println!(
                "last_rebuild_unix: {}",
                freshness
                    .last_rebuild_unix
                    .map(|at| at.to_string())
                    .unwrap_or_else(|| "n/a".to_string())
            );
        }
    }

    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_config_set(runtime: &RuntimeOptions, args: ConfigSetArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let patch = ToolConfigPatch {
        set_api_url: args.api_url,
        set_server: args.server,
        set_language: args.language,
    };
    let wrote = patch_config(&paths.config_path, &patch)?;

    println!("config set");
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("wrote: {}", format_flag(wrote));
    if !wrote {
        println!("note: no changes to write");
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let options = SyncOptions {
        rebuild: !args.no_rebuild,
        from_file: args.from_file,
    };
    let report = sync(&paths, &config, &options)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("sync complete");
    println!("source: {}", report.source);
    println!("pages_synced: {}", report.pages_synced);
    println!(
        "category_memberships_synced: {}",
        report.category_memberships_synced
    );
    println!(
        "category_memberships_skipped: {}",
        report.category_memberships_skipped
    );
    println!("pages_removed: {}", report.pages_removed);
    println!("request_count: {}", report.request_count);
    println!(
        "snapshot: {}",
        report.snapshot_path.as_deref().unwrap_or("<none>")
    );
    match &report.rebuild {
        Some(rebuild_report) => print_rebuild_report("rebuild", rebuild_report),
        None => println!("rebuild: skipped"),
    }
    if let Some(purge) = &report.purge {
        print_purge_report("purge", purge);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_link_add(runtime: &RuntimeOptions, args: LinkAddArgs) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let existing = store::find_link_by_url(&paths, args.url.trim())?;
    let link = store::create_link(&paths, &args.url, &args.text)?;

    println!("link created");
    print_link(&link);
    if let Some(existing) = existing {
        println!("note: link {} already uses this url", existing.link_id);
    }

    let rebuild_report = rebuild(&paths, &config, &RebuildOptions::default())?;
    print_rebuild_report("rebuild", &rebuild_report);
    print_purge_report(
        "purge",
        &purge_wiki_pages(&config, &rebuild_report.affected_page_ids),
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_link_edit(runtime: &RuntimeOptions, args: LinkEditArgs) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    if args.url.is_none() && args.text.is_none() {
        bail!("nothing to change. Pass --url and/or --text.");
    }
    let Some(current) = store::get_link(&paths, args.link_id)? else {
        bail!("link {} not found", args.link_id);
    };
    let url = args.url.as_deref().unwrap_or(&current.url);
    let text = args.text.as_deref().unwrap_or(&current.text);
    let link = store::update_link(&paths, args.link_id, url, text)?;

    println!("link updated");
    print_link(&link);

    // Placement does not depend on link url or text, but pages holding the
    // link render it, so their caches still need the purge.
    let rebuild_report = rebuild(&paths, &config, &RebuildOptions::default())?;
    print_rebuild_report("rebuild", &rebuild_report);
    print_purge_report(
        "purge",
        &purge_wiki_pages(&config, &rebuild_report.affected_page_ids),
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_link_show(runtime: &RuntimeOptions, link_id: i64) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let Some(link) = store::get_link(&paths, link_id)? else {
        bail!("link {link_id} not found");
    };

    print_link(&link);

    let rules = store::rules_for_link(&paths, link_id)?;
    println!("page_rules: {}", rules.page_rules.len());
    for entry in &rules.page_rules {
        println!(
            "  [{}] page {} ({}) fallback={} priority={}",
            entry.rule_id,
            entry.page_id,
            entry.page_title.as_deref().unwrap_or("<not in mirror>"),
            format_flag(entry.fallback),
            entry.priority
        );
    }
    println!("category_rules: {}", rules.category_rules.len());
    for entry in &rules.category_rules {
        println!(
            "  [{}] area={} categories={} fallback={} priority={}",
            entry.rule_id,
            entry.content_area.as_deref().unwrap_or("<any>"),
            if entry.categories.is_empty() {
                "<none>".to_string()
            } else {
                entry.categories.join(", ")
            },
            format_flag(entry.fallback),
            entry.priority
        );
    }

    let assigned = store::page_assignments(&paths, Some(link_id))?;
    println!("assigned_pages: {}", assigned.len());
    for assignment in &assigned {
        println!("  [{}] {}", assignment.page_id, assignment.page_title);
    }

    let unassigned = unassigned_matches_for_link(&paths, &config, link_id)?;
    println!("unassigned_matches: {}", unassigned.len());
    for entry in &unassigned {
        println!(
            "  [{}] {}{}",
            entry.page_id,
            entry.page_title,
            if entry.excluded { " (excluded)" } else { "" }
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_link_list(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, _config) = open_runtime(runtime)?;
    let links = store::list_links(&paths)?;

    println!("links: {}", links.len());
    for link in &links {
        println!(
            "  [{}] pages={} url={} text={}",
            link.link_id, link.page_count, link.url, link.text
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_link_delete(runtime: &RuntimeOptions, link_id: i64) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let report = store::delete_link(&paths, link_id)?;

    println!("link deleted");
    println!("link_id: {}", report.link_id);
    println!("url: {}", report.url);
    println!("rules_deleted: {}", report.rules_deleted);
    println!("assignments_released: {}", report.assignments_released);

    let rebuild_report = rebuild(&paths, &config, &RebuildOptions::default())?;
    print_rebuild_report("rebuild", &rebuild_report);

    let mut purge_ids = report.released_page_ids.clone();
    purge_ids.extend(rebuild_report.affected_page_ids.iter().copied());
    purge_ids.sort_unstable();
    purge_ids.dedup();
    print_purge_report("purge", &purge_wiki_pages(&config, &purge_ids));
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_rule_add_page(runtime: &RuntimeOptions, args: RuleAddPageArgs) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let rule = store::create_page_rule(&paths, &config, args.link_id, &args.page, args.fallback)?;

    println!("rule created");
    print_rule(&rule);

    let rebuild_report = rebuild(&paths, &config, &RebuildOptions::default())?;
    print_rebuild_report("rebuild", &rebuild_report);
    print_purge_report(
        "purge",
        &purge_wiki_pages(&config, &rebuild_report.affected_page_ids),
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_rule_add_category(runtime: &RuntimeOptions, args: RuleAddCategoryArgs) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let rule = store::create_category_rule(
        &paths,
        &config,
        args.link_id,
        args.content_area.as_deref(),
        &args.categories,
        args.fallback,
    )?;

    println!("rule created");
    print_rule(&rule);

    let rebuild_report = rebuild(&paths, &config, &RebuildOptions::default())?;
    print_rebuild_report("rebuild", &rebuild_report);
    print_purge_report(
        "purge",
        &purge_wiki_pages(&config, &rebuild_report.affected_page_ids),
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_rule_delete(runtime: &RuntimeOptions, rule_id: i64) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let rule = store::delete_rule(&paths, rule_id)?;

    println!("rule deleted");
    print_rule(&rule);

    let rebuild_report = rebuild(&paths, &config, &RebuildOptions::default())?;
    print_rebuild_report("rebuild", &rebuild_report);
    print_purge_report(
        "purge",
        &purge_wiki_pages(&config, &rebuild_report.affected_page_ids),
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_rule_list(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, _config) = open_runtime(runtime)?;
    let rules = store::list_rules(&paths)?;

    println!("rules: {}", rules.len());
    for rule in &rules {
        let matcher = if rule.kind == "page" {
            format!(
                "page {}",
                rule.page_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "?".to_string())
            )
        } else {
            let area = rule.content_area.as_deref().unwrap_or("<any>");
            if rule.categories.is_empty() {
                format!("area={area}")
            } else {
                format!("area={area} categories={}", rule.categories.join(", "))
            }
        };
        println!(
            "  [{}] link={} {} fallback={} priority={} url={}",
            rule.rule_id,
            rule.link_id,
            matcher,
            format_flag(rule.fallback),
            rule.priority,
            rule.link_url.as_deref().unwrap_or("<missing>")
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_rebuild(runtime: &RuntimeOptions, args: RebuildArgs) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let report = rebuild(
        &paths,
        &config,
        &RebuildOptions {
            dry_run: args.dry_run,
        },
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.dry_run {
        println!("rebuild (dry run)");
    } else {
        println!("rebuild");
    }
    print_rebuild_report("rebuild", &report);
    if !report.dry_run {
        print_purge_report(
            "purge",
            &purge_wiki_pages(&config, &report.affected_page_ids),
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_page_links(runtime: &RuntimeOptions, args: PageLinksArgs) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let report = render_links_for_page(&paths, &config, &args.page)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("page links");
    println!("page_id: {}", report.page_id);
    println!("page_title: {}", report.page_title);
    println!("links: {}", report.links.len());
    for link in &report.links {
        println!("  [{}] url={} text={}", link.link_id, link.url, link.text);
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_log(runtime: &RuntimeOptions, args: LogArgs) -> Result<()> {
    let (paths, _config) = open_runtime(runtime)?;
    let limit = args.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    let entries = audit::recent_entries(&paths, args.link, limit)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("audit log");
    println!("entries: {}", entries.len());
    for entry in &entries {
        println!(
            "  [{}] {} at={} link={} details={}",
            entry.entry_id,
            entry.action,
            entry.logged_at_unix,
            entry
                .link_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry.details
        );
    }
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths);
    ensure_runtime_initialized(&paths, &status)?;

    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("migrations_applied: {}", report.applied.len());
    for migration in &report.applied {
        println!("  v{:03} {}", migration.version, migration.name);
    }
    println!("schema_version: {}", report.current_version);
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = open_runtime(runtime)?;
    let status = inspect_runtime(&paths);
    let freshness = staleness(&paths, &config)?;

    println!("db stats");
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("schema_version: {}", schema_version(&paths)?);
    print_stats("store", &store::stats(&paths)?);
    println!("assignments_stale: {}", format_flag(freshness.stale));
    println!(
        "last_rebuild_unix: {}",
        freshness
            .last_rebuild_unix
            .map(|at| at.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "last_rebuild_fallback_assignments: {}",
        freshness
            .last_rebuild_fallback_assignments
            .map(|count| count.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }

    Ok(())
}

fn print_link(link: &Link) {
    println!("link_id: {}", link.link_id);
    println!("url: {}", link.url);
    println!("text: {}", link.text);
}

fn print_rule(rule: &Rule) {
    println!("rule_id: {}", rule.rule_id);
    println!("link_id: {}", rule.link_id);
    println!("kind: {}", rule.matcher.kind());
    println!("fallback: {}", format_flag(rule.fallback));
    println!("priority: {}", rule.priority);
    match &rule.matcher {
        RuleMatch::Page { page_id } => println!("page_id: {page_id}"),
        RuleMatch::Categories {
            content_area,
            categories,
        } => {
            println!(
                "content_area: {}",
                content_area.as_deref().unwrap_or("<any>")
            );
            println!(
                "categories: {}",
                if categories.is_empty() {
                    "<none>".to_string()
                } else {
                    categories.join(", ")
                }
            );
        }
    }
}

fn print_rebuild_report(prefix: &str, report: &RebuildReport) {
    println!(
        "{prefix}.candidates_considered: {}",
        report.candidates_considered
    );
    println!(
        "{prefix}.assignments_written: {}",
        report.assignments_written
    );
    println!("{prefix}.pages_assigned: {}", report.pages_assigned);
    println!("{prefix}.assignments_added: {}", report.assignments_added);
    println!(
        "{prefix}.assignments_removed: {}",
        report.assignments_removed
    );
    println!(
        "{prefix}.fallback_assignments: {}",
        report.fallback_assignments
    );
    println!("{prefix}.affected_pages: {}", report.affected_page_ids.len());
}

fn print_purge_report(prefix: &str, report: &PurgeReport) {
    println!("{prefix}.requested: {}", report.requested);
    println!("{prefix}.purged: {}", report.purged);
    if report.failed {
        println!("{prefix}.failed: yes");
    }
    if let Some(detail) = &report.detail {
        println!("{prefix}.detail: {detail}");
    }
}

fn print_stats(prefix: &str, stats: &StoreStats) {
    println!("{prefix}.links: {}", stats.links);
    println!("{prefix}.page_rules: {}", stats.page_rules);
    println!("{prefix}.category_rules: {}", stats.category_rules);
    println!("{prefix}.fallback_rules: {}", stats.fallback_rules);
    println!("{prefix}.assignments: {}", stats.assignments);
    println!("{prefix}.assigned_pages: {}", stats.assigned_pages);
    println!("{prefix}.pages_at_cap: {}", stats.pages_at_cap);
    println!("{prefix}.mirrored_pages: {}", stats.mirrored_pages);
    println!(
        "{prefix}.mirrored_category_memberships: {}",
        stats.mirrored_category_memberships
    );
    println!(
        "{prefix}.content_areas_in_use: {}",
        stats.content_areas_in_use
    );
}

fn open_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, ToolConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths);
    ensure_runtime_initialized(&paths, &status)?;
    let pending = pending_migration_count(&paths)?;
    if pending > 0 {
        bail!("{pending} schema migration(s) pending. {MIGRATIONS_POLICY_MESSAGE}");
    }
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    // A project-local .env can add LINKPLACER_* overrides, so resolution
    // reruns on a fresh environment snapshot after loading it.
    let initial = resolve_paths(&ResolutionContext::from_process()?, &overrides);
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
        return Ok(resolve_paths(&ResolutionContext::from_process()?, &overrides));
    }
    Ok(initial)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
