use crate::cli::{GlobalArgs, ModelsAction, ModelsArgs, open_store};

pub async fn execute(global: GlobalArgs, args: ModelsArgs) -> anyhow::Result<()> {
    match args.action {
        ModelsAction::Inspect { path } => {
            let scan = gguf_parser::quick_scan(&path)?;
            println!("{}", serde_json::to_string_pretty(&scan)?);
        }
        ModelsAction::List => {
            let engine = open_store(&global)?;
            let entries = engine.list()?;
            if entries.is_empty() {
                println!("No models installed in {}", engine.layout().root().display());
                return Ok(());
            }

            println!(
                "{:<40} {:<14} {:<10} {:<8} {:<10} {:<20}",
                "Name", "ID", "Size", "Params", "Quant", "Modified"
            );
            println!("{}", "-".repeat(104));
            for entry in &entries {
                println!(
                    "{:<40} {:<14} {:<10} {:<8} {:<10} {:<20}",
                    entry.name,
                    entry.id,
                    human_size(entry.size),
                    entry.parameter_size.as_deref().unwrap_or("-"),
                    entry.quantization.as_deref().unwrap_or("-"),
                    entry.modified.format("%Y-%m-%d %H:%M"),
                );
            }
            println!("\n{} model(s) installed.", entries.len());
        }
        ModelsAction::Show { name } => {
            let details = open_store(&global)?.show(&name)?;
            println!("{}", serde_json::to_string_pretty(&details)?);
        }
        ModelsAction::Rm { name } => {
            let manifest = open_store(&global)?.delete(&name)?;
            println!("Deleted '{name}' ({} layers released)", manifest.layers.len());
        }
    }
    Ok(())
}

/// `omm prune`
pub async fn prune(global: GlobalArgs) -> anyhow::Result<()> {
    let report = open_store(&global)?.prune()?;
    println!(
        "Removed {} blob(s) and {} temporary file(s), reclaimed {}",
        report.blobs_removed,
        report.temp_files_removed,
        human_size(report.bytes_reclaimed),
    );
    Ok(())
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    for &unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.1} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1} PiB")
}
