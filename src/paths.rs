use std::path::PathBuf;
use std::sync::OnceLock;

static CORE_HOME: OnceLock<PathBuf> = OnceLock::new();

/// Returns the platform's data home (`~/.ling-core/`). Supports
/// `$LING_CORE_HOME` override, cached via `OnceLock`.
pub fn core_home() -> &'static PathBuf {
    CORE_HOME.get_or_init(|| {
        if let Ok(val) = std::env::var("LING_CORE_HOME") {
            let p = PathBuf::from(val);
            if !p.as_os_str().is_empty() {
                return p;
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ling-core")
    })
}

/// `<home>/kits/` — §6 `<module_base>/<owner>/<kit_id>/<version>/`
pub fn kits_dir() -> PathBuf {
    core_home().join("kits")
}

/// `<home>/workspace-seeds/` — §6 `<workspace_base>/<owner>/<kit_id>/<version>/workspace/`
pub fn workspace_seeds_dir() -> PathBuf {
    core_home().join("workspace-seeds")
}

/// `<home>/workspaces/` — §6 `<workspaces>/<workspace_name>/`
pub fn workspaces_dir() -> PathBuf {
    core_home().join("workspaces")
}

/// `<home>/venvs/` — §6 `<venvs>/<owner>_<kit_id>_<version>_py<minor>/`
pub fn venvs_dir() -> PathBuf {
    core_home().join("venvs")
}

/// `<home>/db/` — redb-backed state (modules, provides graph, chat history, document store)
pub fn db_dir() -> PathBuf {
    core_home().join("db")
}

/// `<home>/logs/`
pub fn logs_dir() -> PathBuf {
    core_home().join("logs")
}

/// `<home>/config/`
pub fn config_dir() -> PathBuf {
    core_home().join("config")
}
