//! 规则目录加载与热更新
//!
//! 目录中每个规则文件对应一个流程，文件名（不含扩展名）即流程 ID。
//! `RuleDirWatcher` 监听目录变化，去抖后整体重新加载，模拟后端规则刷新。

use crate::error::Result;
use crate::registry::RuleRegistry;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use payscript_shared::config::RulesConfig;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 一次目录加载的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// 读取或解析失败的文件
    pub failed: Vec<PathBuf>,
    /// 文件已删除而被移除的流程
    pub removed: Vec<String>,
}

/// 规则目录加载器
///
/// 记住上次从目录加载的流程 ID，重新加载时移除文件已不存在的流程。
/// 解析失败的文件不会覆盖已注册的旧规则。
pub struct RuleLoader {
    extensions: Vec<String>,
    known: Mutex<BTreeSet<String>>,
}

impl RuleLoader {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            known: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn from_config(config: &RulesConfig) -> Self {
        Self::new(config.extensions.iter().cloned())
    }

    /// 加载目录中的所有规则文件
    pub fn load_dir(&self, registry: &RuleRegistry, dir: &Path) -> Result<LoadReport> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file() && self.accepts(&path) {
                files.push(path);
            }
        }
        files.sort();

        let mut report = LoadReport::default();
        let mut present = BTreeSet::new();

        for path in files {
            let Some(process_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let process_id = process_id.to_string();
            present.insert(process_id.clone());

            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "规则文件读取失败，已跳过");
                    report.failed.push(path);
                    continue;
                }
            };

            if registry.register_dsl(&process_id, &source) {
                report.loaded.push(process_id);
            } else {
                report.failed.push(path);
            }
        }

        let mut known = self.known.lock();
        for stale in known.difference(&present) {
            if registry.remove(stale).is_ok() {
                report.removed.push(stale.clone());
            }
        }
        *known = present;

        info!(
            dir = %dir.display(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            "规则目录加载完成"
        );

        Ok(report)
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|e| e == ext))
    }
}

/// 规则目录监听器
///
/// 文件系统事件经 debounce 窗口去抖后触发一次整体重新加载。
/// 启动与停止都需要显式调用；启动需要在 tokio runtime 中。
pub struct RuleDirWatcher {
    dir: PathBuf,
    debounce: Duration,
    loader: Arc<RuleLoader>,
    registry: RuleRegistry,
    shutdown_tx: watch::Sender<bool>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RuleDirWatcher {
    pub fn new(
        dir: impl AsRef<Path>,
        debounce: Duration,
        loader: Arc<RuleLoader>,
        registry: RuleRegistry,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            dir: dir.as_ref().to_path_buf(),
            debounce,
            loader,
            registry,
            shutdown_tx,
            watcher: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.lock().is_some()
    }

    /// 启动监听；重复调用无效果
    pub fn start(&self) -> Result<()> {
        let mut slot = self.watcher.lock();
        if slot.is_some() {
            return Ok(());
        }

        // notify 回调运行在自己的线程，通过 channel 转发到 tokio 任务
        let (event_tx, mut event_rx) = mpsc::channel::<()>(16);
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) {
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => warn!(error = %e, "规则目录监听事件错误"),
            })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        let _ = self.shutdown_tx.send(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let dir = self.dir.clone();
        let debounce = self.debounce;
        let loader = Arc::clone(&self.loader);
        let registry = self.registry.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        tokio::time::sleep(debounce).await;
                        while event_rx.try_recv().is_ok() {}

                        if let Err(e) = loader.load_dir(&registry, &dir) {
                            error!(dir = %dir.display(), error = %e, "规则目录重新加载失败，保留当前规则");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *slot = Some(watcher);
        *self.task.lock() = Some(task);
        info!(dir = %self.dir.display(), "规则目录监听已启动");
        Ok(())
    }

    /// 停止监听并等待后台任务退出
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.watcher.lock().take();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!(dir = %self.dir.display(), "规则目录监听已停止");
        }
    }
}
