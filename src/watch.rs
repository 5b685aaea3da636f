use crate::background::Background;
use crate::config::{self, ServiceConfig};
use crate::process::Launcher;
use crate::registry::Registry;
use crate::service::Service;
use notify::event::{CreateKind, EventKind, ModifyKind, RenameMode};
use notify::{Event, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const EVENT_BUFFER: usize = 256;

// ---------------------------------------------------------------------------
// Event classification
// ---------------------------------------------------------------------------

/// A change to one file in the configuration directory, by file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    Created(String),
    Removed(String),
    Modified(String),
}

impl ConfigChange {
    pub fn file(&self) -> &str {
        match self {
            ConfigChange::Created(f) | ConfigChange::Removed(f) | ConfigChange::Modified(f) => f,
        }
    }
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}

pub fn classify(event: &Event) -> Vec<ConfigChange> {
    let names = || event.paths.iter().filter_map(|p| file_name(p));
    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => names().map(ConfigChange::Created).collect(),
        EventKind::Remove(_) => names().map(ConfigChange::Removed).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            names().map(ConfigChange::Removed).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            names().map(ConfigChange::Created).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut changes = Vec::new();
            if let Some(from) = event.paths.first().and_then(|p| file_name(p)) {
                changes.push(ConfigChange::Removed(from));
            }
            if let Some(to) = event.paths.get(1).and_then(|p| file_name(p)) {
                changes.push(ConfigChange::Created(to));
            }
            changes
        }
        // Backends that cannot tell the two halves of a rename apart.
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .filter_map(|p| {
                let name = file_name(p)?;
                Some(if p.exists() {
                    ConfigChange::Created(name)
                } else {
                    ConfigChange::Removed(name)
                })
            })
            .collect(),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => names().map(ConfigChange::Modified).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Keeps the registry in line with the configuration directory.
pub struct ConfigWatcher {
    config_dir: PathBuf,
    registry: Registry,
    launcher: Launcher,
    ignore: fn(&str) -> bool,
}

impl ConfigWatcher {
    pub fn new(config_dir: PathBuf, registry: Registry, launcher: Launcher) -> Self {
        Self {
            config_dir,
            registry,
            launcher,
            ignore: config::is_ignored_file,
        }
    }

    pub fn with_ignore(mut self, ignore: fn(&str) -> bool) -> Self {
        self.ignore = ignore;
        self
    }

    /// Applies one change. The registry is locked for the whole change.
    pub async fn apply(&self, change: ConfigChange) {
        if (self.ignore)(change.file()) {
            tracing::trace!(file = %change.file(), "ignoring file");
            return;
        }
        match change {
            ConfigChange::Created(file) | ConfigChange::Modified(file) => {
                match config::load(&self.config_dir, &file) {
                    Ok(config) => self.upsert(config).await,
                    Err(e) => tracing::error!("{e}"),
                }
            }
            ConfigChange::Removed(file) => self.remove(&file).await,
        }
    }

    async fn upsert(&self, config: ServiceConfig) {
        let mut services = self.registry.lock().await;

        if let Some(existing) = services.find(&config.name)
            && existing.config().file != config.file
        {
            tracing::error!(
                file = %config.file,
                existing_file = %existing.config().file,
                "a service named {} already exists, ignoring file",
                config.name
            );
            return;
        }

        let file = config.file.clone();
        if services.find_by_file(&file).is_none() {
            let name = config.name.clone();
            tracing::info!(service = %name, file = %file, "service added");
            if let Err(e) = services.add(Service::new(config, self.launcher.clone())) {
                tracing::error!("{e}");
                return;
            }
            if let Some(service) = services.find_mut(&name)
                && let Err(e) = service.start().await
            {
                tracing::error!("{e}");
            }
            return;
        }
        let Some(service) = services.find_by_file_mut(&file) else {
            return;
        };

        if service.config() == &config {
            return;
        }

        tracing::info!(service = %service.name(), file = %file, "configuration changed");
        let mut restart = false;
        if service.is_running() {
            match service.stop().await {
                Ok(()) => restart = true,
                Err(e) => tracing::error!("{e}"),
            }
        }
        services.replace_config(&file, config);

        if restart
            && let Some(service) = services.find_by_file_mut(&file)
            && let Err(e) = service.start_reloaded().await
        {
            tracing::error!("{e}");
        }
    }

    async fn remove(&self, file: &str) {
        let mut services = self.registry.lock().await;
        let Some(service) = services.find_by_file_mut(file) else {
            return;
        };
        if service.is_running()
            && let Err(e) = service.stop().await
        {
            tracing::error!("{e}");
        }
        service.cancel_restart();
        if let Some(removed) = services.remove_where(|s| s.config().file == file) {
            tracing::info!(service = %removed.name(), file = %file, "service removed");
        }
    }

    /// Starts watching the directory. Fails only if the watch cannot be set
    /// up; errors reported by the watch afterwards are logged.
    pub fn spawn(self) -> Result<Background, notify::Error> {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.blocking_send(res);
        })?;
        watcher.watch(&self.config_dir, RecursiveMode::NonRecursive)?;
        tracing::info!(dir = %self.config_dir.display(), "watching configuration");

        Ok(Background::spawn("config-watcher", move |token| async move {
            let _watcher = watcher;
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    Ok(event) => {
                        for change in classify(&event) {
                            self.apply(change).await;
                        }
                    }
                    Err(e) => tracing::error!("configuration watcher error: {e}"),
                }
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Paths;
    use crate::service::ServiceState;
    use notify::event::{DataChange, RemoveKind};
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        config_dir: PathBuf,
        registry: Registry,
        launcher: Launcher,
        watcher: ConfigWatcher,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let config_dir = paths.config_dir().to_path_buf();
        std::fs::create_dir_all(&config_dir).unwrap();
        let (launcher, _exits) = Launcher::new(paths);
        let registry = Registry::new();
        let watcher = ConfigWatcher::new(config_dir.clone(), registry.clone(), launcher.clone());
        Fixture {
            _dir: dir,
            config_dir,
            registry,
            launcher,
            watcher,
        }
    }

    impl Fixture {
        fn write(&self, file: &str, body: &str) {
            std::fs::write(self.config_dir.join(file), body).unwrap();
        }

        async fn stop_all(&self) {
            let mut services = self.registry.lock().await;
            for service in services.iter_mut() {
                if service.is_running() {
                    service.stop().await.unwrap();
                }
            }
        }
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |e, p| e.add_path(PathBuf::from(p)))
    }

    #[test]
    fn test_classify_basic_kinds() {
        assert_eq!(
            classify(&event(EventKind::Create(CreateKind::File), &["/c/web.toml"])),
            [ConfigChange::Created("web.toml".to_string())]
        );
        assert_eq!(
            classify(&event(EventKind::Remove(RemoveKind::File), &["/c/web.toml"])),
            [ConfigChange::Removed("web.toml".to_string())]
        );
        assert_eq!(
            classify(&event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/c/web.toml"]
            )),
            [ConfigChange::Modified("web.toml".to_string())]
        );
        assert!(classify(&event(EventKind::Create(CreateKind::Folder), &["/c/sub"])).is_empty());
    }

    #[test]
    fn test_classify_renames() {
        assert_eq!(
            classify(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::From)),
                &["/c/web.toml"]
            )),
            [ConfigChange::Removed("web.toml".to_string())]
        );
        assert_eq!(
            classify(&event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/c/web.toml.tmp", "/c/web.toml"]
            )),
            [
                ConfigChange::Removed("web.toml.tmp".to_string()),
                ConfigChange::Created("web.toml".to_string())
            ]
        );
    }

    #[test]
    fn test_classify_ambiguous_rename_checks_existence() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("here.toml");
        std::fs::write(&present, "").unwrap();
        let gone = dir.path().join("gone.toml");

        let e = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(present)
            .add_path(gone);
        assert_eq!(
            classify(&e),
            [
                ConfigChange::Created("here.toml".to_string()),
                ConfigChange::Removed("gone.toml".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_creates_keep_priority_then_insertion_order() {
        let f = fixture();
        f.write("c.toml", "command = \"sleep 999\"\npriority = 1");
        f.write("a.toml", "command = \"sleep 999\"\npriority = 1");
        f.write("b.toml", "command = \"sleep 999\"\npriority = 2");

        for file in ["c.toml", "a.toml", "b.toml"] {
            f.watcher.apply(ConfigChange::Created(file.to_string())).await;
        }

        {
            let services = f.registry.lock().await;
            assert_eq!(services.names(), ["c", "a", "b"]);
            assert_eq!(services.stop_order(), ["b", "a", "c"]);
            assert!(services.iter().all(|s| s.is_running()));
        }
        f.stop_all().await;
    }

    #[tokio::test]
    async fn test_modify_with_equal_config_is_noop() {
        let f = fixture();
        f.write("web.toml", "command = \"sleep 999\"");
        f.watcher.apply(ConfigChange::Created("web.toml".to_string())).await;
        let pid = f.registry.lock().await.find("web").unwrap().pid();

        // Same meaning, different text.
        f.write("web.toml", "# touched\ncommand = \"sleep 999\"\n");
        f.watcher.apply(ConfigChange::Modified("web.toml".to_string())).await;

        {
            let services = f.registry.lock().await;
            let web = services.find("web").unwrap();
            assert_eq!(web.pid(), pid);
            assert_eq!(web.restarts(), 0);
        }
        f.stop_all().await;
    }

    #[tokio::test]
    async fn test_modify_priority_resorts_and_restarts() {
        let f = fixture();
        f.write("a.toml", "command = \"sleep 999\"\npriority = 1");
        f.write("b.toml", "command = \"sleep 999\"\npriority = 2");
        f.watcher.apply(ConfigChange::Created("a.toml".to_string())).await;
        f.watcher.apply(ConfigChange::Created("b.toml".to_string())).await;
        let old_pid = f.registry.lock().await.find("a").unwrap().pid();

        f.write("a.toml", "command = \"sleep 999\"\npriority = 5");
        f.watcher.apply(ConfigChange::Modified("a.toml".to_string())).await;

        {
            let services = f.registry.lock().await;
            assert_eq!(services.names(), ["b", "a"]);
            let a = services.find("a").unwrap();
            assert!(a.is_running());
            assert_ne!(a.pid(), old_pid);
            assert_eq!(a.restarts(), 1);
            assert_eq!(a.config().priority, 5);
        }
        f.stop_all().await;
    }

    #[tokio::test]
    async fn test_modify_after_failed_stop_resorts_without_restart() {
        let f = fixture();
        f.write("web.toml", "command = \"sleep 999\"\nkill_signal = \"BOGUS\"\npriority = 1");
        f.write("b.toml", "command = \"sleep 999\"\npriority = 2");
        f.watcher.apply(ConfigChange::Created("web.toml".to_string())).await;
        f.watcher.apply(ConfigChange::Created("b.toml".to_string())).await;
        let pid = f.registry.lock().await.find("web").unwrap().pid();
        assert!(pid.is_some());

        // Stopping fails on the unknown signal; the new config still applies.
        f.write("web.toml", "command = \"sleep 999\"\nkill_signal = \"BOGUS\"\npriority = 5");
        f.watcher.apply(ConfigChange::Modified("web.toml".to_string())).await;

        {
            let services = f.registry.lock().await;
            assert_eq!(services.names(), ["b", "web"]);
            let web = services.find("web").unwrap();
            assert_eq!(web.config().priority, 5);
            assert!(web.is_running());
            assert_eq!(web.pid(), pid);
            assert_eq!(web.restarts(), 0);
        }

        let pid = nix::unistd::Pid::from_raw(pid.unwrap() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();
        let mut services = f.registry.lock().await;
        services.find_mut("b").unwrap().stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_modify_stopped_service_swaps_config_only() {
        let f = fixture();
        f.write("web.toml", "command = \"sleep 999\"");
        f.watcher.apply(ConfigChange::Created("web.toml".to_string())).await;
        f.registry.lock().await.find_mut("web").unwrap().stop().await.unwrap();

        f.write("web.toml", "command = \"sleep 998\"");
        f.watcher.apply(ConfigChange::Modified("web.toml".to_string())).await;

        let services = f.registry.lock().await;
        let web = services.find("web").unwrap();
        assert_eq!(web.state(), &ServiceState::Stopped);
        assert_eq!(web.config().command, "sleep 998");
        assert_eq!(web.restarts(), 0);
    }

    #[tokio::test]
    async fn test_modify_untracked_file_creates() {
        let f = fixture();
        f.write("late.toml", "command = \"sleep 999\"");
        f.watcher.apply(ConfigChange::Modified("late.toml".to_string())).await;
        assert!(f.registry.lock().await.find("late").unwrap().is_running());
        f.stop_all().await;
    }

    #[tokio::test]
    async fn test_remove_stops_and_drops_service() {
        let f = fixture();
        f.write("web.toml", "command = \"sleep 999\"");
        f.watcher.apply(ConfigChange::Created("web.toml".to_string())).await;

        std::fs::remove_file(f.config_dir.join("web.toml")).unwrap();
        f.watcher.apply(ConfigChange::Removed("web.toml".to_string())).await;
        assert!(f.registry.lock().await.is_empty());

        // Unknown files are ignored silently.
        f.watcher.apply(ConfigChange::Removed("other.toml".to_string())).await;
    }

    #[tokio::test]
    async fn test_ignored_files_never_reach_registry() {
        let f = fixture();
        f.write(".web.toml.swp", "command = \"sleep 999\"");
        f.watcher.apply(ConfigChange::Created(".web.toml.swp".to_string())).await;
        f.write("web.toml~", "command = \"sleep 999\"");
        f.watcher.apply(ConfigChange::Modified("web.toml~".to_string())).await;
        assert!(f.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_custom_ignore_predicate() {
        fn only_toml(name: &str) -> bool {
            !name.ends_with(".toml")
        }
        let f = fixture();
        let watcher = ConfigWatcher::new(f.config_dir.clone(), f.registry.clone(), f.launcher.clone())
            .with_ignore(only_toml);

        f.write("notes.txt", "command = \"true\"");
        watcher.apply(ConfigChange::Created("notes.txt".to_string())).await;
        assert!(f.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_name_collision_keeps_existing_service() {
        let f = fixture();
        f.write("web.toml", "command = \"sleep 999\"");
        f.watcher.apply(ConfigChange::Created("web.toml".to_string())).await;

        f.write("other.toml", "name = \"web\"\ncommand = \"sleep 998\"");
        f.watcher.apply(ConfigChange::Created("other.toml".to_string())).await;

        {
            let services = f.registry.lock().await;
            assert_eq!(services.len(), 1);
            assert_eq!(services.find("web").unwrap().config().file, "web.toml");
        }
        f.stop_all().await;
    }

    #[tokio::test]
    async fn test_unparseable_file_is_skipped() {
        let f = fixture();
        f.write("broken.toml", "command = ");
        f.watcher.apply(ConfigChange::Created("broken.toml".to_string())).await;
        assert!(f.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_spawned_watcher_picks_up_new_files() {
        let f = fixture();
        let registry = f.registry.clone();
        let config_dir = f.config_dir.clone();
        let task = f.watcher.spawn().unwrap();

        std::fs::write(config_dir.join("web.toml"), "command = \"sleep 999\"").unwrap();

        let mut found = false;
        for _ in 0..100 {
            if registry.lock().await.find("web").is_some_and(|s| s.is_running()) {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(found, "watcher did not add the new service");

        task.shutdown().await;
        let mut services = registry.lock().await;
        services.find_mut("web").unwrap().stop().await.unwrap();
    }
}
