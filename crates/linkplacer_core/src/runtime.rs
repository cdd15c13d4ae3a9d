use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

pub const MIGRATIONS_POLICY_MESSAGE: &str =
    "Run `linkplacer db migrate` to apply pending schema migrations.";

const STATE_DIR_NAME: &str = ".linkplacer";
const DB_FILENAME: &str = "linkplacer.db";
const CONFIG_FILENAME: &str = "config.toml";

/// Where a resolved path came from, strongest override first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

/// Paths forced from the command line. Anything left `None` falls through to
/// the environment and then to the defaults under the state dir.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// Snapshot of the process environment taken at resolution time. Callers that
/// load a project `.env` file must capture a fresh snapshot afterwards; tests
/// build one directly instead of mutating real environment variables.
#[derive(Debug, Clone, Default)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
    pub env_project_root: Option<String>,
    pub env_data_dir: Option<String>,
    pub env_config: Option<String>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
            env_project_root: env_setting("LINKPLACER_PROJECT_ROOT"),
            env_data_dir: env_setting("LINKPLACER_DATA_DIR"),
            env_config: env_setting("LINKPLACER_CONFIG"),
        })
    }
}

// Set-but-blank variables behave as unset.
fn env_setting(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Absolute locations of everything the tool reads and writes, plus where
/// each overridable path came from.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub project_root: PathBuf,
    pub state_dir: PathBuf,
    pub data_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub data_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Multi-line `key=value (source)` listing for the `--diagnostics` flag.
    pub fn diagnostics(&self) -> String {
        [
            format!(
                "project_root={} ({})",
                display_path(&self.project_root),
                self.root_source.as_str()
            ),
            format!("state_dir={}", display_path(&self.state_dir)),
            format!(
                "data_dir={} ({})",
                display_path(&self.data_dir),
                self.data_source.as_str()
            ),
            format!("snapshots_dir={}", display_path(&self.snapshots_dir)),
            format!("db_path={}", display_path(&self.db_path)),
            format!(
                "config_path={} ({})",
                display_path(&self.config_path),
                self.config_source.as_str()
            ),
            format!("policy={MIGRATIONS_POLICY_MESSAGE}"),
        ]
        .join("\n")
    }
}

pub fn resolve_paths(context: &ResolutionContext, overrides: &PathOverrides) -> ResolvedPaths {
    let (project_root, root_source) = resolve_project_root(context, overrides);
    let state_dir = project_root.join(STATE_DIR_NAME);

    let (data_dir, data_source) = pick_path(
        overrides.data_dir.as_deref(),
        context.env_data_dir.as_deref(),
        state_dir.join("data"),
        &project_root,
    );
    let (config_path, config_source) = pick_path(
        overrides.config.as_deref(),
        context.env_config.as_deref(),
        state_dir.join(CONFIG_FILENAME),
        &project_root,
    );

    ResolvedPaths {
        snapshots_dir: state_dir.join("snapshots"),
        db_path: data_dir.join(DB_FILENAME),
        project_root,
        state_dir,
        data_dir,
        config_path,
        root_source,
        data_source,
        config_source,
    }
}

// The flag anchors at the invocation cwd, not at any detected root.
fn resolve_project_root(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> (PathBuf, ValueSource) {
    if let Some(path) = overrides.project_root.as_deref() {
        return (rooted(path, &context.cwd), ValueSource::Flag);
    }
    if let Some(value) = context.env_project_root.as_deref() {
        return (rooted(Path::new(value), &context.cwd), ValueSource::Env);
    }
    let detected = find_marker_root(&context.cwd)
        .or_else(|| context.executable_dir.as_deref().and_then(find_marker_root));
    (
        detected.unwrap_or_else(|| context.cwd.clone()),
        ValueSource::Heuristic,
    )
}

/// Nearest ancestor that already contains a `.linkplacer/` state dir.
fn find_marker_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(STATE_DIR_NAME).exists())
        .map(Path::to_path_buf)
}

fn pick_path(
    flag: Option<&Path>,
    env_value: Option<&str>,
    default: PathBuf,
    project_root: &Path,
) -> (PathBuf, ValueSource) {
    if let Some(path) = flag {
        return (rooted(path, project_root), ValueSource::Flag);
    }
    if let Some(value) = env_value {
        return (rooted(Path::new(value), project_root), ValueSource::Env);
    }
    (default, ValueSource::Default)
}

// Relative overrides anchor at `base`, absolute ones pass through.
fn rooted(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Existence report for the resolved layout. Warnings are advisory; only
/// [`ensure_runtime_initialized`] turns a missing state dir into an error.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub project_root_exists: bool,
    pub state_dir_exists: bool,
    pub data_dir_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> RuntimeStatus {
    let db_metadata = fs::metadata(&paths.db_path).ok();
    let state_dir_exists = paths.state_dir.exists();
    let config_exists = paths.config_path.exists();

    let mut warnings = Vec::new();
    if !state_dir_exists {
        warnings.push(format!(
            "{STATE_DIR_NAME}/ is missing; run `linkplacer init` before other commands"
        ));
    } else {
        if db_metadata.is_none() {
            warnings
                .push("database is missing; run `linkplacer db migrate` to create it".to_string());
        }
        if !config_exists {
            warnings.push(format!(
                "{CONFIG_FILENAME} is missing; sync and purge need [wiki] api_url"
            ));
        }
    }

    RuntimeStatus {
        project_root_exists: paths.project_root.exists(),
        state_dir_exists,
        data_dir_exists: paths.data_dir.exists(),
        db_exists: db_metadata.is_some(),
        db_size_bytes: db_metadata.map(|metadata| metadata.len()),
        config_exists,
        warnings,
    }
}

pub fn ensure_runtime_initialized(paths: &ResolvedPaths, status: &RuntimeStatus) -> Result<()> {
    if status.state_dir_exists {
        return Ok(());
    }
    bail!(
        "Runtime layout is not initialized: {} does not exist.\nRun: linkplacer init --project-root {}",
        display_path(&paths.state_dir),
        display_path(&paths.project_root)
    );
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut report = InitReport {
        created_dirs: Vec::new(),
        wrote_config: false,
    };

    for dir in [
        paths.state_dir.clone(),
        paths.data_dir.clone(),
        paths.snapshots_dir.clone(),
    ] {
        if dir.exists() {
            continue;
        }
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        report.created_dirs.push(dir);
    }

    if options.materialize_config {
        let config = starter_config(paths);
        report.wrote_config = seed_file(&paths.config_path, &config, options.force)?;
    }

    Ok(report)
}

fn starter_config(paths: &ResolvedPaths) -> String {
    format!(
        "# linkplacer runtime configuration (written by `linkplacer init`)
# {MIGRATIONS_POLICY_MESSAGE}

[wiki]
# api_url = \"https://your-wiki.example.org/api.php\"
# user_agent = \"linkplacer/0.1\"

[site]
# server = \"https://your-wiki.example.org\"
# language = \"en\"

[placement]
excluded_article_types = []
valid_content_areas = []

[paths]
project_root = \"{}\"
state_dir = \"{}\"
data_dir = \"{}\"
db_path = \"{}\"

[database]
migrations = \"enabled\"
strategy = \"sequential\"
",
        display_path(&paths.project_root),
        display_path(&paths.state_dir),
        display_path(&paths.data_dir),
        display_path(&paths.db_path),
    )
}

fn seed_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

// Windows separators normalize to forward slashes in all printed paths.
fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{
        InitOptions, PathOverrides, ResolutionContext, ValueSource, ensure_runtime_initialized,
        init_layout, inspect_runtime, resolve_paths,
    };

    fn context_at(cwd: &Path) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
            ..ResolutionContext::default()
        }
    }

    #[test]
    fn flag_wins_over_env_for_project_root() {
        let temp = tempdir().expect("tempdir");
        let from_flag = temp.path().join("flag-root");
        let context = ResolutionContext {
            env_project_root: Some(temp.path().join("env-root").to_string_lossy().to_string()),
            ..context_at(&temp.path().join("cwd"))
        };
        let overrides = PathOverrides {
            project_root: Some(from_flag.clone()),
            ..PathOverrides::default()
        };

        let resolved = resolve_paths(&context, &overrides);
        assert_eq!(resolved.project_root, from_flag);
        assert_eq!(resolved.root_source, ValueSource::Flag);
    }

    #[test]
    fn relative_env_root_anchors_at_cwd() {
        let temp = tempdir().expect("tempdir");
        let context = ResolutionContext {
            env_project_root: Some("proj".to_string()),
            ..context_at(temp.path())
        };

        let resolved = resolve_paths(&context, &PathOverrides::default());
        assert_eq!(resolved.project_root, temp.path().join("proj"));
        assert_eq!(resolved.root_source, ValueSource::Env);
    }

    #[test]
    fn marker_directory_found_in_ancestors() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        let nested = root.join("a").join("b");
        fs::create_dir_all(root.join(".linkplacer")).expect("marker dir");
        fs::create_dir_all(&nested).expect("nested cwd");

        let resolved = resolve_paths(&context_at(&nested), &PathOverrides::default());
        assert_eq!(resolved.project_root, root);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
    }

    #[test]
    fn cwd_is_fallback_without_marker() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path().join("bare");
        fs::create_dir_all(&cwd).expect("create cwd");

        let resolved = resolve_paths(&context_at(&cwd), &PathOverrides::default());
        assert_eq!(resolved.project_root, cwd);
        assert_eq!(resolved.root_source, ValueSource::Heuristic);
        assert_eq!(resolved.db_path, cwd.join(".linkplacer/data/linkplacer.db"));
    }

    #[test]
    fn data_dir_env_override_is_project_relative() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let context = ResolutionContext {
            env_data_dir: Some("elsewhere".to_string()),
            ..context_at(&root)
        };
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };

        let resolved = resolve_paths(&context, &overrides);
        assert_eq!(resolved.data_dir, root.join("elsewhere"));
        assert_eq!(resolved.data_source, ValueSource::Env);
        assert_eq!(resolved.db_path, root.join("elsewhere").join("linkplacer.db"));
    }

    #[test]
    fn init_creates_layout_and_seeds_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths(&context_at(&root), &overrides);

        let report = init_layout(&paths, &InitOptions::default()).expect("init");

        assert!(!report.created_dirs.is_empty());
        assert!(report.wrote_config);
        assert!(paths.state_dir.exists());
        assert!(paths.data_dir.exists());
        assert!(paths.snapshots_dir.exists());
        assert!(paths.config_path.exists());
    }

    #[test]
    fn init_keeps_existing_config() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths(&context_at(&root), &overrides);
        init_layout(&paths, &InitOptions::default()).expect("first init");
        fs::write(&paths.config_path, "[wiki]\napi_url = \"https://w/api.php\"\n")
            .expect("write config");

        let second = init_layout(&paths, &InitOptions::default()).expect("second init");
        assert!(!second.wrote_config);
        let kept = fs::read_to_string(&paths.config_path).expect("read config");
        assert!(kept.contains("https://w/api.php"));

        let forced = init_layout(
            &paths,
            &InitOptions {
                materialize_config: true,
                force: true,
            },
        )
        .expect("forced init");
        assert!(forced.wrote_config);
    }

    #[test]
    fn status_warns_before_init() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("project");
        fs::create_dir_all(&root).expect("create root");
        let overrides = PathOverrides {
            project_root: Some(root.clone()),
            ..PathOverrides::default()
        };
        let paths = resolve_paths(&context_at(&root), &overrides);

        let status = inspect_runtime(&paths);
        assert!(!status.state_dir_exists);
        assert!(!status.warnings.is_empty());

        let err = ensure_runtime_initialized(&paths, &status).expect_err("must fail");
        assert!(
            err.to_string()
                .contains("Runtime layout is not initialized")
        );
    }
}
