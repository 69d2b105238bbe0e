//! `omm import` / `omm export`: one transfer in the foreground, Ctrl-C cancels.

use std::io::Write;
use std::sync::{Arc, Mutex};

use model_store::{Engine, ImportRequest, ProgressSink, TransferKind, TransferSession};

use crate::cli::models::human_size;
use crate::cli::{ExportArgs, GlobalArgs, ImportArgs, open_store};

pub async fn import(global: GlobalArgs, args: ImportArgs) -> anyhow::Result<()> {
    let engine = Arc::new(open_store(&global)?);

    let mut req = ImportRequest::new(&args.file).overwrite(args.force);
    if let Some(name) = args.name {
        req = req.named(name);
    }
    let session = engine.begin(TransferKind::Import, req.label());
    let record = run_cancellable(engine, session, move |engine, session, sink| {
        engine.import_with(session, &req, sink)
    })
    .await?;

    println!(
        "Imported '{}' ({} layers, {})",
        record.name.short(),
        record.manifest.layers.len(),
        human_size(record.manifest.total_size()),
    );
    Ok(())
}

pub async fn export(global: GlobalArgs, args: ExportArgs) -> anyhow::Result<()> {
    let engine = Arc::new(open_store(&global)?);

    let session = engine.begin(TransferKind::Export, args.model.clone());
    let ExportArgs { model, path } = args;
    let target = path.clone();
    let bytes = run_cancellable(engine, session, move |engine, session, sink| {
        engine.export_with(session, &model, &target, sink)
    })
    .await?;

    println!("Exported to {} ({})", path.display(), human_size(bytes));
    Ok(())
}

/// Run `job` on the blocking pool; the first Ctrl-C cancels the session.
async fn run_cancellable<T, F>(
    engine: Arc<Engine>,
    session: Arc<TransferSession>,
    job: F,
) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Engine, &TransferSession, &dyn ProgressSink) -> model_store::Result<T>
        + Send
        + 'static,
{
    let worker = Arc::clone(&session);
    let mut handle = tokio::task::spawn_blocking(move || {
        let progress = StderrProgress::new(worker.label());
        let result = job(&*engine, &*worker, &progress);
        progress.done();
        result
    });

    let joined = tokio::select! {
        res = &mut handle => res,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nCancelling...");
            session.cancel();
            handle.await
        }
    };
    Ok(joined??)
}

//  Progress line

struct StderrProgress {
    label: String,
    last_percent: Mutex<Option<u64>>,
}

impl StderrProgress {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            last_percent: Mutex::new(None),
        }
    }

    fn done(&self) {
        let printed = self
            .last_percent
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false);
        if printed {
            eprintln!();
        }
    }
}

impl ProgressSink for StderrProgress {
    fn progress(&self, processed: u64, total: u64) {
        let percent = (processed * 100).checked_div(total).unwrap_or(100).min(100);
        let Ok(mut last) = self.last_percent.lock() else {
            return;
        };
        if *last == Some(percent) {
            return;
        }
        *last = Some(percent);
        let mut err = std::io::stderr().lock();
        let _ = write!(
            err,
            "\r{}: {percent:>3}% ({} / {})",
            self.label,
            human_size(processed),
            human_size(total)
        );
        let _ = err.flush();
    }
}
