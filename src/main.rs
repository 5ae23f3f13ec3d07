use std::{path::Path, sync::Arc};

use anyhow::{ensure, Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};

use interactive_seg_rs::{
    config::{AnnotateArgs, Command, Config, FetchArgs},
    imageops_ai::mask,
    model::{AutoMaskConfig, SamModel},
    script::{self, ScriptLine},
    session::{AnnotationSession, SessionEvent, Staged},
    weights::{default_cache_root, HttpFetcher, WeightCache},
    worker::PredictionWorker,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match &config.command {
        Command::Annotate(args) => annotate(args).await,
        Command::FetchWeights(args) => fetch_weights(args.clone()).await,
    }
}

async fn annotate(args: &AnnotateArgs) -> Result<()> {
    ensure!(args.image.exists(), "Image does not exist");
    ensure!(args.encoder_path.exists(), "Encoder model path does not exist");
    ensure!(args.decoder_path.exists(), "Decoder model path does not exist");

    let steps = script::read(&args.script)?;
    let script_dir = args.script.parent().unwrap_or_else(|| Path::new("."));

    let model = Arc::new(
        SamModel::new(&args.encoder_path, &args.decoder_path, args.device_id)?
            .with_auto_config(AutoMaskConfig::from(&args.auto)),
    );
    let worker = PredictionWorker::new(Arc::clone(&model)).with_timeout(args.prediction_timeout());
    let mut session = AnnotationSession::with_model(model);

    let image = image::open(&args.image)
        .with_context(|| format!("Failed to open image: {}", args.image.display()))?;
    tokio::task::block_in_place(|| session.on_image_changed(&image))?;

    for ScriptLine { line, step } in steps {
        let event = step.into_event(script_dir)?;
        match apply(&mut session, &worker, event).await {
            Ok(()) => {}
            Err(e) if e.is_usage_error() => warn!(line, "{}", e),
            Err(e) => return Err(e).with_context(|| format!("Script line {} failed", line)),
        }
    }

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    session
        .label_surface()
        .to_image()?
        .save(&args.output)
        .with_context(|| format!("Failed to save labels: {}", args.output.display()))?;
    info!(
        path = %args.output.display(),
        objects = session.label_surface().distinct_ids().len(),
        "labels saved"
    );

    if let Some(path) = &args.candidate_output {
        mask::to_luma(&session.candidate_mask())
            .save(path)
            .with_context(|| format!("Failed to save candidate mask: {}", path.display()))?;
    }

    Ok(())
}

async fn apply(
    session: &mut AnnotationSession<SamModel>,
    worker: &PredictionWorker<SamModel>,
    event: SessionEvent,
) -> interactive_seg_rs::Result<()> {
    match event {
        SessionEvent::Prompt(prompt) => {
            if let Staged::Pending(request) = session.begin_prompt_event(prompt)? {
                let outcome = worker.run(request).await;
                session.complete_prediction(outcome.generation, outcome.result)?;
            }
        }
        other => {
            tokio::task::block_in_place(|| session.handle_event(other))?;
        }
    }
    Ok(())
}

async fn fetch_weights(args: FetchArgs) -> Result<()> {
    let path = tokio::task::spawn_blocking(move || -> Result<_> {
        let root = args.cache_dir.unwrap_or_else(default_cache_root);
        let cache = WeightCache::new(root, HttpFetcher::new()?);
        Ok(cache.resolve(args.variant)?)
    })
    .await??;
    println!("{}", path.display());
    Ok(())
}
