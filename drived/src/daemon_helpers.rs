/// Logs loader notifications.
struct LoggingObserver;

impl ChangeListLoaderObserver for LoggingObserver {
    fn on_directory_changed(&self, path: &str) {
        debug!(%path, "directory changed");
    }

    fn on_load_completed(&self, scope: &LoadScope) {
        match scope {
            LoadScope::ChangeList => debug!("change list load completed"),
            LoadScope::Directory(path) => debug!(%path, "directory load completed"),
        }
    }

    fn on_initial_load_complete(&self) {
        info!("metadata is ready");
    }
}

fn poll_failure_is_retryable(err: &FileSystemError) -> bool {
    match err {
        FileSystemError::Service(err) => err.is_retryable(),
        FileSystemError::Storage(_) | FileSystemError::Load(_) => true,
        FileSystemError::NotFound(_) | FileSystemError::NotADirectory(_) => false,
    }
}

fn render_listing(children: &[EntrySummary]) -> Vec<String> {
    children
        .iter()
        .map(|child| {
            if child.is_directory {
                format!("{}/", child.title)
            } else {
                child.title.clone()
            }
        })
        .collect()
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_var(var: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> u64 {
    var(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}
