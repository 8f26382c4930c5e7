use argh::FromArgs;
use kornia_captioner::{
    AnalysisResult, BatchRunner, Config, InferenceClient, SUPPORTED_EXTENSIONS, SaveFormat,
    error::UNAVAILABLE_MESSAGE, export_results,
};
use std::{path::PathBuf, sync::Arc};

#[derive(FromArgs)]
/// Caption every image in a folder with a local multimodal inference server
struct CaptionerArgs {
    /// settings file to load (defaults to the per-user settings file)
    #[argh(option)]
    config: Option<PathBuf>,

    /// inference server url, e.g. http://localhost:11434
    #[argh(option, short = 's')]
    server: Option<String>,

    /// model used for captioning
    #[argh(option, short = 'm')]
    model: Option<String>,

    /// command to execute: "caption", "status", "models" or "config"
    #[argh(subcommand)]
    command: CaptionerCommands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum CaptionerCommands {
    Caption(CaptionCommand),
    Status(StatusCommand),
    Models(ModelsCommand),
    Config(ConfigCommand),
}

#[derive(FromArgs)]
/// Caption all images under a folder
#[argh(subcommand, name = "caption")]
struct CaptionCommand {
    /// the folder to scan recursively
    #[argh(positional)]
    folder: PathBuf,

    /// the prompt sent with every image
    #[argh(option, short = 'p')]
    prompt: Option<String>,

    /// request timeout in seconds (30-600)
    #[argh(option, short = 't')]
    timeout: Option<u64>,

    /// number of images analyzed at the same time (1-5)
    #[argh(option, short = 'j')]
    concurrency: Option<usize>,

    /// save the results to disk when the batch is over
    #[argh(switch)]
    save: bool,

    /// format of the saved results: json, csv or txt
    #[argh(option, short = 'f')]
    format: Option<SaveFormat>,

    /// directory for the saved results (defaults to the scanned folder)
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

#[derive(FromArgs)]
/// Check that the inference server is reachable
#[argh(subcommand, name = "status")]
struct StatusCommand {}

#[derive(FromArgs)]
/// List the models installed on the inference server
#[argh(subcommand, name = "models")]
struct ModelsCommand {}

#[derive(FromArgs)]
/// Print the effective settings
#[argh(subcommand, name = "config")]
struct ConfigCommand {
    /// write the effective settings back to the settings file
    #[argh(switch)]
    save: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: CaptionerArgs = argh::from_env();

    let settings_path = args.config.clone().or_else(Config::default_path);
    let mut config = match &settings_path {
        Some(path) => Config::load_or_default(path),
        None => Config::default(),
    };

    if let Some(server) = args.server {
        config.server_url = server;
    }
    if let Some(model) = args.model {
        config.model_name = model;
    }

    match args.command {
        CaptionerCommands::Caption(command) => {
            if let Some(prompt) = command.prompt {
                config.prompt = prompt;
            }
            if let Some(timeout) = command.timeout {
                config.timeout_seconds = timeout;
            }
            if let Some(concurrency) = command.concurrency {
                config.concurrency_level = concurrency;
            }
            if command.save {
                config.save_results = true;
            }
            if let Some(format) = command.format {
                config.save_format = format;
            }
            config.validate();

            let results = caption_folder(&config, &command.folder).await?;

            if config.save_results {
                let dir = command.output.unwrap_or(command.folder);
                let path =
                    export_results(&results, &dir, config.save_format, config.include_timestamp)?;
                println!("Saved results to {}", path.display());
            }
        }
        CaptionerCommands::Status(_) => {
            let client = InferenceClient::new(config)?;
            check_status(&client).await;
        }
        CaptionerCommands::Models(_) => {
            let client = InferenceClient::new(config)?;
            let models = client.list_models().await;
            if models.is_empty() {
                println!("No models found.");
            }
            for model in models {
                println!(
                    "{:<40} {:>12} {}",
                    model.name,
                    format_size(model.size_bytes),
                    model.modified_at
                );
            }
        }
        CaptionerCommands::Config(command) => {
            config.validate();
            println!("{}", serde_json::to_string_pretty(&config)?);
            if command.save {
                match &settings_path {
                    Some(path) => {
                        config.save(path)?;
                        println!("Saved settings to {}", path.display());
                    }
                    None => log::error!("No settings location available on this platform"),
                }
            }
        }
    }

    Ok(())
}

async fn caption_folder(
    config: &Config,
    folder: &std::path::Path,
) -> Result<Vec<AnalysisResult>, Box<dyn std::error::Error>> {
    let client = Arc::new(InferenceClient::new(config.clone())?);
    if !check_status(&client).await {
        log::warn!("Continuing anyway; every image will report the connection failure");
    }

    let runner = BatchRunner::new(client, config.concurrency_level);
    let mut run = runner.run(folder, SUPPORTED_EXTENSIONS).await?;
    println!("Analyzing {} images in {}", run.total(), folder.display());

    let mut results = Vec::with_capacity(run.total());
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            next = run.next() => match next {
                Some(result) => {
                    let progress = run.progress();
                    println!(
                        "[{}/{}] {}: {}",
                        progress.current, progress.total, result.file_name, result.caption
                    );
                    results.push(result);
                }
                None => break,
            },
            _ = &mut ctrl_c, if !run.is_cancelled() => {
                println!("Cancelling, waiting for in-flight requests to finish...");
                run.cancel();
            }
        }
    }

    println!(
        "Batch {}: processed {} of {} images.",
        run.state().as_str(),
        results.len(),
        run.total()
    );
    Ok(results)
}

async fn check_status(client: &InferenceClient) -> bool {
    if !client.is_available().await {
        println!("{UNAVAILABLE_MESSAGE}");
        return false;
    }

    println!("Inference server at {} is ready.", client.base_url());
    let model_name = &client.config().model_name;
    let models = client.list_models().await;
    if !models.iter().any(|m| m.name.contains(model_name.as_str())) {
        println!(
            "Model '{model_name}' was not found on the server. Install it first (e.g. `ollama pull {model_name}`)."
        );
    }
    true
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
