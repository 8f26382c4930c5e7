use crate::{batch::AnalysisResult, config::SaveFormat, error::ExportError};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    io::Write,
    path::{Path, PathBuf},
};

const BASE_FILE_NAME: &str = "captions";

#[derive(Serialize)]
struct JsonExport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    generated_at: Option<String>,
    results: &'a [AnalysisResult],
}

/// Writes `results` into `dir` in the given format and returns the path of
/// the file written.
///
/// With `include_timestamp` the file name carries the export time and the
/// document records it as well.
pub fn export_results(
    results: &[AnalysisResult],
    dir: &Path,
    format: SaveFormat,
    include_timestamp: bool,
) -> Result<PathBuf, ExportError> {
    let timestamp = include_timestamp.then(Local::now);
    export_results_at(results, dir, format, timestamp)
}

fn export_results_at(
    results: &[AnalysisResult],
    dir: &Path,
    format: SaveFormat,
    timestamp: Option<DateTime<Local>>,
) -> Result<PathBuf, ExportError> {
    std::fs::create_dir_all(dir)?;

    let file_name = match timestamp {
        Some(ts) => format!(
            "{BASE_FILE_NAME}_{}.{}",
            ts.format("%Y%m%d_%H%M%S"),
            format.extension()
        ),
        None => format!("{BASE_FILE_NAME}.{}", format.extension()),
    };
    let path = dir.join(file_name);
    let generated_at = timestamp.map(|ts| ts.to_rfc3339());

    match format {
        SaveFormat::Json => {
            let document = JsonExport {
                generated_at,
                results,
            };
            let file = std::fs::File::create(&path)?;
            serde_json::to_writer_pretty(file, &document)?;
        }
        SaveFormat::Csv => {
            let mut writer = csv::Writer::from_path(&path)?;
            for result in results {
                writer.serialize(result)?;
            }
            writer.flush()?;
        }
        SaveFormat::Txt => {
            let mut file = std::io::BufWriter::new(std::fs::File::create(&path)?);
            if let Some(ts) = &generated_at {
                writeln!(file, "# Generated at {ts}")?;
                writeln!(file)?;
            }
            for result in results {
                writeln!(file, "{}", result.file_name)?;
                writeln!(file, "{}", result.caption)?;
                writeln!(file)?;
            }
            file.flush()?;
        }
    }

    log::info!("Exported {} results to {}", results.len(), path.display());
    Ok(path)
}
