use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

mod audio;
mod bot;
mod config;
mod error;
mod library;
mod orchestrator;
#[cfg(test)]
mod testing;
mod ui;
mod voice;
mod worker;

use crate::audio::{process::FfmpegLauncher, replaygain::SymphoniaProbe};
use crate::bot::RadioBot;
use crate::config::Config;
use crate::library::JsonLibrary;
use crate::orchestrator::{Collaborators, GuildOrchestrator, LogNotifier};
use crate::voice::SongbirdPlatform;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("guild_radio=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();

    info!("📻 Iniciando Guild Radio v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;
    info!("{}", config.summary());

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    // Cargar biblioteca
    let library = Arc::new(JsonLibrary::load(config.library_path.clone()).await?);
    info!("📚 Biblioteca cargada: {} pistas", library.len());

    // Driver de voz compartido entre el cliente y los workers
    let songbird = Songbird::serenity();
    let platform = SongbirdPlatform::new(songbird.clone());

    let collaborators = Collaborators {
        library: library.clone(),
        probe: Arc::new(SymphoniaProbe),
        launcher: Arc::new(FfmpegLauncher),
        platform: Arc::new(platform.clone()),
        notifier: Arc::new(LogNotifier),
    };
    let (orchestrator, events) =
        GuildOrchestrator::new(collaborators, config.pipeline(), config.max_queue_size);
    let orchestrator = Arc::new(orchestrator);
    orchestrator.spawn_event_loop(events);

    // Configurar intents mínimos necesarios
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_VOICE_STATES;

    let termination_timeout = Duration::from_secs(config.termination_timeout_secs);
    let handler = RadioBot::new(config.clone(), orchestrator.clone(), library, platform);

    // Construir cliente
    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Iniciar bot
    info!("🚀 Bot iniciado exitosamente");
    tokio::select! {
        result = client.start() => {
            if let Err(why) = result {
                error!("Error al ejecutar cliente: {:?}", why);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Error al registrar Ctrl+C: {:?}", e);
            }
            info!("⚠️ Señal de shutdown recibida, cerrando...");
        }
    }

    // Cada worker termina su ffmpeg en dos fases; damos margen para ambas
    orchestrator.shutdown_all(termination_timeout * 2).await;
    client.shard_manager.shutdown_all().await;
    info!("👋 Guild Radio detenido");

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    // Verificar dependencias críticas
    let ffmpeg = tokio::process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if ffmpeg.status.success() && config.library_path.exists() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
