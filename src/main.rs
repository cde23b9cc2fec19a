use anyhow::Result;
use inquire::Confirm;
use std::process::ExitCode;
use std::sync::Arc;

use moral2video::core::config::Config;
use moral2video::core::io::{NativeStorage, Storage};
use moral2video::core::state::{RunStatus, RunStore};
use moral2video::services::assembly::VideoAssembler;
use moral2video::services::characters::CharacterRegistry;
use moral2video::services::illustration::IllustrationGenerator;
use moral2video::services::image::create_image_client;
use moral2video::services::llm::create_llm;
use moral2video::services::narrative::NarrativeGenerator;
use moral2video::services::scenario::ScenarioLibrary;
use moral2video::services::setup::ensure_character_references;
use moral2video::services::speech::create_speech_client;
use moral2video::services::voice::VoiceSynthesizer;
use moral2video::services::workflow::WorkflowManager;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    env_logger::init();

    let args = parse_args(std::env::args().skip(1));
    let moral = args.moral;
    if moral.trim().is_empty() {
        eprintln!("Usage: moral2video [--run-id <id>] <moraleja>");
        eprintln!("Example: moral2video \"hay que decir siempre la verdad\"");
        eprintln!("Reusing the id of an interrupted run resumes it.");
        return Ok(ExitCode::FAILURE);
    }

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with valid llm, image and speech settings.");
            return Err(e);
        }
    };

    config.ensure_directories()?;

    if !config.unattended {
        let proceed = Confirm::new(&format!("Generar video para la moraleja \"{moral}\"?"))
            .with_default(true)
            .prompt()?;
        if !proceed {
            return Ok(ExitCode::SUCCESS);
        }
    }

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    let registry = Arc::new(CharacterRegistry::builtin(std::path::Path::new(
        &config.assets_folder,
    )));

    let llm = create_llm(&config)?;
    let image = create_image_client(&config)?;
    let speech: Arc<dyn moral2video::services::speech::SpeechClient> =
        Arc::from(create_speech_client(&config)?);

    // The cast references anchor every illustration prompt; a fresh install
    // generates the missing ones before the first story runs.
    let generated = ensure_character_references(&registry, &image, &storage).await?;
    if generated > 0 {
        println!("Referencias de personajes generadas: {generated}");
    }

    let narrative = NarrativeGenerator::new(llm, registry.clone(), config.profile.clone(), &config.llm);
    let voices = VoiceSynthesizer::new(
        speech,
        &registry,
        &config.speech.voices,
        storage.clone(),
        config.speech.max_concurrency,
    );
    let scenarios = Arc::new(
        ScenarioLibrary::load(&config.scenarios_dir(), image.clone(), storage.clone()).await?,
    );
    let illustrations = IllustrationGenerator::new(
        image,
        scenarios,
        storage.clone(),
        config.image.max_concurrency,
    );
    let assembler = VideoAssembler::new(
        config.assembly.clone(),
        storage.clone(),
        config.sounds_dir(),
    );

    let workflow = WorkflowManager::new(
        config,
        registry,
        narrative,
        voices,
        illustrations,
        assembler,
        RunStore::new(),
        storage,
    );

    let run = match &args.run_id {
        Some(run_id) => workflow.run_with_id(&moral, run_id).await?,
        None => workflow.run(&moral).await?,
    };
    Ok(match run.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

struct CliArgs {
    moral: String,
    run_id: Option<String>,
}

/// One positional moral (possibly several words) plus an optional
/// `--run-id` to resume an interrupted run.
fn parse_args<I: Iterator<Item = String>>(mut args: I) -> CliArgs {
    let mut run_id = None;
    let mut words = Vec::new();
    while let Some(arg) = args.next() {
        if let Some(id) = arg.strip_prefix("--run-id=") {
            run_id = Some(id.to_string());
        } else if arg == "--run-id" {
            run_id = args.next();
        } else {
            words.push(arg);
        }
    }
    CliArgs {
        moral: words.join(" "),
        run_id,
    }
}
