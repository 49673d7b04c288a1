use anyhow::{Context, Result, anyhow, bail};
use atelier_core::assets::is_safe_relative_path;
use atelier_core::project::{Export, ExportKind, ProjectFileManager, read_manifest};
use atelier_core::storage::{AutoSaveManager, FileStore, RecoveryPoint};
use atelier_core::{Document, EngineConfig};
use atelier_render::PngRasterizer;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn project_manager(config: &EngineConfig) -> ProjectFileManager {
    ProjectFileManager::with_config(
        Arc::new(PngRasterizer),
        config.project,
        config.assets.clone(),
    )
}

fn load(config: &EngineConfig, file: &Path) -> Result<(ProjectFileManager, Document)> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let mut manager = project_manager(config);
    let document = manager
        .load_bytes(&bytes)
        .with_context(|| format!("loading {}", file.display()))?;
    Ok((manager, document))
}

pub fn info(file: &Path, json: bool) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let manifest = read_manifest(&bytes).with_context(|| format!("reading {}", file.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }
    println!("Name:      {}", manifest.name);
    println!("Id:        {}", manifest.id);
    println!("Version:   {}", manifest.version);
    println!("Modified:  {}", manifest.modified_at);
    println!("Layers:    {}", manifest.layer_count);
    println!("Assets:    {} bytes", manifest.total_size);
    println!(
        "Thumbnail: {}",
        match &manifest.thumbnail {
            Some(bytes) => format!("{} bytes", bytes.len()),
            None => "none".to_string(),
        }
    );
    Ok(())
}

pub fn verify(config: &EngineConfig, file: &Path) -> Result<()> {
    let (manager, document) = load(config, file)?;
    document
        .validate()
        .with_context(|| format!("validating {}", file.display()))?;
    println!(
        "{}: OK ({} layers, {} assets, {} bytes of payload)",
        file.display(),
        document.layer_count(),
        manager.assets().len(),
        manager.assets().total_size()
    );
    Ok(())
}

pub fn unpack(config: &EngineConfig, file: &Path, out_dir: &Path) -> Result<()> {
    let (mut manager, document) = load(config, file)?;
    let Export::Archive(entries) = manager.export(&document, ExportKind::Archive)? else {
        bail!("archive export returned another kind");
    };
    for (name, bytes) in &entries {
        if !is_safe_relative_path(name) {
            bail!("refusing to write archive entry outside {}: {name}", out_dir.display());
        }
        let path = out_dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
        log::debug!("Wrote {} ({} bytes)", path.display(), bytes.len());
    }
    println!("Unpacked {} entries into {}", entries.len(), out_dir.display());
    Ok(())
}

pub fn flatten(config: &EngineConfig, file: &Path, out: &Path) -> Result<()> {
    let (mut manager, document) = load(config, file)?;
    let Export::Image { bytes, .. } = manager.export(&document, ExportKind::FlattenedImage)? else {
        bail!("flatten returned another kind");
    };
    fs::write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote {} ({} bytes)", out.display(), bytes.len());
    Ok(())
}

fn print_points(points: &[RecoveryPoint]) {
    if points.is_empty() {
        println!("No recovery points");
        return;
    }
    for point in points.iter().rev() {
        println!(
            "{}  {}  {:<24} {:>3} layers {:>10} bytes  {}",
            point.id,
            point.timestamp.format("%Y-%m-%d %H:%M:%S"),
            point.document_name,
            point.layer_count,
            point.size,
            if point.autosave { "auto" } else { "manual" }
        );
    }
}

pub async fn recover(
    config: &EngineConfig,
    store: &Path,
    point: Option<&str>,
    out: Option<&Path>,
) -> Result<()> {
    let storage = Arc::new(
        FileStore::new(store).with_context(|| format!("opening store {}", store.display()))?,
    );
    let autosave = AutoSaveManager::new(storage, project_manager(config), config.autosave.clone());
    let points = autosave.recovery_points().await?;

    let Some(out) = out else {
        print_points(&points);
        return Ok(());
    };

    let chosen = match point {
        Some(id) => points
            .iter()
            .find(|p| p.id.to_string() == id)
            .ok_or_else(|| anyhow!("no recovery point {id}"))?,
        None => points.last().ok_or_else(|| anyhow!("store has no recovery points"))?,
    };
    let document = autosave.restore(chosen).await?;

    let mut manager = project_manager(config);
    let Export::Encoded(bytes) = manager.export(&document, ExportKind::Encoded)? else {
        bail!("encoded export returned another kind");
    };
    fs::write(out, &bytes).with_context(|| format!("writing {}", out.display()))?;
    println!(
        "Restored '{}' from {} to {}",
        document.name(),
        chosen.timestamp,
        out.display()
    );
    Ok(())
}

pub fn show_config(config: &EngineConfig) -> Result<()> {
    println!("{}", config.to_json()?);
    Ok(())
}
