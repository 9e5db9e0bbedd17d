//! Out-of-core query engine plumbing.
//!
//! Stages express their transformations as SQL against tables registered on
//! a [`SessionContext`], and persist results with [`write_parquet`], which
//! streams record batches straight into a parquet writer.

pub mod columns;

use anyhow::{Context, Result, anyhow};
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::parquet::arrow::ArrowWriter;
use datafusion::parquet::basic::{Compression, ZstdLevel};
use datafusion::parquet::file::properties::WriterProperties;
use datafusion::prelude::{CsvReadOptions, DataFrame, ParquetReadOptions, SessionConfig, SessionContext};
use futures::StreamExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::EngineConfig;

/// Builds a session honouring the configured memory pool and parallelism.
pub fn session(config: &EngineConfig) -> Result<SessionContext> {
    let mut session_config = SessionConfig::new();
    if let Some(partitions) = config.target_partitions {
        session_config = session_config.with_target_partitions(partitions);
    }
    if let Some(batch_size) = config.batch_size {
        session_config = session_config.with_batch_size(batch_size);
    }

    let mut runtime = RuntimeEnvBuilder::new();
    if let Some(limit) = config.memory_limit_bytes {
        runtime = runtime.with_memory_limit(limit, 1.0);
    }

    Ok(SessionContext::new_with_config_rt(
        session_config,
        runtime.build_arc()?,
    ))
}

pub fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("path is not valid UTF-8: {}", path.display()))
}

/// Quotes a string as a SQL literal.
pub fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Opens one raw file, reading parquet or CSV by extension.
pub async fn read_source(ctx: &SessionContext, path: &Path) -> Result<DataFrame> {
    let location = path_str(path)?;
    let df = match path.extension().and_then(|e| e.to_str()) {
        Some("parquet") => {
            ctx.read_parquet(location, ParquetReadOptions::default())
                .await?
        }
        Some("csv") => ctx.read_csv(location, CsvReadOptions::new()).await?,
        _ => return Err(anyhow!("unsupported source format: {}", path.display())),
    };
    Ok(df)
}

/// Registers one raw file as `name`.
pub async fn register_source(ctx: &SessionContext, name: &str, path: &Path) -> Result<()> {
    let df = read_source(ctx, path).await?;
    ctx.register_table(name, df.into_view())?;
    Ok(())
}

/// Opens a set of parquet tables as one scan.
pub async fn read_parquet_files(ctx: &SessionContext, paths: &[PathBuf]) -> Result<DataFrame> {
    if paths.is_empty() {
        return Err(anyhow!("no parquet files to read"));
    }
    let locations = paths
        .iter()
        .map(|p| path_str(p).map(str::to_string))
        .collect::<Result<Vec<_>>>()?;
    Ok(ctx
        .read_parquet(locations, ParquetReadOptions::default())
        .await?)
}

/// Registers a set of parquet tables under `name`.
pub async fn register_parquet_files(
    ctx: &SessionContext,
    name: &str,
    paths: &[PathBuf],
) -> Result<()> {
    let df = read_parquet_files(ctx, paths).await?;
    ctx.register_table(name, df.into_view())?;
    Ok(())
}

/// Runs `sql` and registers the result as a view named `name`.
pub async fn register_view(ctx: &SessionContext, name: &str, sql: &str) -> Result<()> {
    let df = ctx.sql(sql).await?;
    ctx.register_table(name, df.into_view())?;
    Ok(())
}

/// Executes `df` and streams its batches into a single zstd parquet file.
///
/// Returns the number of rows written. The file is always created, with the
/// result schema, even when the query yields no rows. Batches go to a
/// sibling `.tmp` file that is renamed into place only once the footer is
/// written, so a failed query never leaves a truncated table at `path`.
pub async fn write_parquet(df: DataFrame, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    match stream_to_file(df, &tmp).await {
        Ok(rows) => {
            std::fs::rename(&tmp, path)
                .with_context(|| format!("moving {} into place", tmp.display()))?;
            debug!(path = %path.display(), rows, "Parquet table written");
            Ok(rows)
        }
        Err(e) => {
            if tmp.exists() {
                if let Err(cleanup) = std::fs::remove_file(&tmp) {
                    warn!(path = %tmp.display(), error = %cleanup, "Failed to remove partial table");
                }
            }
            Err(e.context(format!("writing {}", path.display())))
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn stream_to_file(df: DataFrame, path: &Path) -> Result<usize> {
    let mut stream = df.execute_stream().await?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .build();
    let mut writer = ArrowWriter::try_new(file, stream.schema(), Some(props))?;

    let mut rows = 0;
    while let Some(batch) = stream.next().await {
        let batch = batch?;
        rows += batch.num_rows();
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(rows)
}

/// Runs `sql` and writes the result to `path`.
pub async fn copy_to_parquet(ctx: &SessionContext, sql: &str, path: &Path) -> Result<usize> {
    let df = ctx.sql(sql).await?;
    write_parquet(df, path).await
}

/// Row count of an existing parquet table.
pub async fn row_count(ctx: &SessionContext, path: &Path) -> Result<usize> {
    let df = read_parquet_files(ctx, &[path.to_path_buf()]).await?;
    Ok(df.count().await?)
}

/// Lists `*.parquet` files directly under `dir`, sorted by name.
pub fn list_parquet(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("parquet") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
