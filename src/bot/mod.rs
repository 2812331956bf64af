//! # Bot Module
//!
//! Thin Discord surface over the [`GuildOrchestrator`].
//!
//! [`RadioBot`] implements Serenity's [`EventHandler`]: it registers the
//! slash commands on `ready`, turns interactions into orchestrator calls and
//! forwards voice-state updates to the voice platform, which routes them to
//! the worker owning the guild.

use anyhow::Result;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Interaction, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub mod commands;
pub mod handlers;

use crate::{
    config::Config,
    library::JsonLibrary,
    orchestrator::GuildOrchestrator,
    voice::{SongbirdPlatform, VoiceStateChange},
};

/// Main Discord event handler.
pub struct RadioBot {
    config: Arc<Config>,
    pub orchestrator: Arc<GuildOrchestrator>,
    pub library: Arc<JsonLibrary>,
    platform: SongbirdPlatform,
}

impl RadioBot {
    pub fn new(
        config: Config,
        orchestrator: Arc<GuildOrchestrator>,
        library: Arc<JsonLibrary>,
        platform: SongbirdPlatform,
    ) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
            library,
            platform,
        }
    }

    /// Registra los comandos slash, globales o por guild según configuración
    async fn register_commands(&self, ctx: &Context) -> Result<()> {
        info!("📝 Registrando comandos slash...");
        info!("🔧 Application ID: {}", self.config.application_id);

        match self.config.guild_id {
            Some(guild_id) => {
                let guild_id = GuildId::new(guild_id);

                if !ctx.cache.guilds().contains(&guild_id) {
                    warn!("⚠️ El bot no está en la guild especificada: {}", guild_id);
                    return Ok(());
                }

                commands::register_guild_commands(ctx, guild_id).await.map_err(|e| {
                    error!("❌ Error registrando comandos de guild: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos de guild")
                })?;
                info!("✅ Comandos de guild registrados para: {}", guild_id);
            }
            None => {
                commands::register_global_commands(ctx).await.map_err(|e| {
                    error!("❌ Error registrando comandos globales: {:?}", e);
                    anyhow::anyhow!("No se pudieron registrar comandos globales")
                })?;
                info!("✅ Comandos globales registrados");
            }
        }

        Ok(())
    }

    /// Oyentes que no son bots en `channel_id`, según la caché
    fn count_listeners(ctx: &Context, guild_id: GuildId, channel_id: ChannelId) -> usize {
        let Some(guild) = ctx.cache.guild(guild_id) else {
            return 0;
        };

        guild
            .voice_states
            .values()
            .filter(|state| state.channel_id == Some(channel_id))
            .filter(|state| {
                let is_bot = state
                    .member
                    .as_ref()
                    .map(|member| member.user.bot)
                    .or_else(|| ctx.cache.user(state.user_id).map(|user| user.bot))
                    .unwrap_or(false);
                !is_bot
            })
            .count()
    }
}

#[async_trait]
impl EventHandler for RadioBot {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea!", ready.user.name);
        info!("📊 Conectado a {} servidores", ready.guilds.len());

        if let Err(e) = self.register_commands(&ctx).await {
            error!("Error al registrar comandos: {:?}", e);
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = handlers::handle_command(&ctx, command, self).await {
                error!("Error manejando comando: {:?}", e);
            }
        }
    }

    /// Reenvía cambios de voz al worker del guild con el recuento de oyentes
    async fn voice_state_update(&self, ctx: Context, old: Option<VoiceState>, new: VoiceState) {
        let Some(guild_id) = new.guild_id else {
            return;
        };
        let Some(bot_channel) = self.platform.channel_of(guild_id) else {
            return;
        };

        let listeners = Self::count_listeners(&ctx, guild_id, bot_channel);
        let change = VoiceStateChange {
            user_id: new.user_id,
            old_channel: old.and_then(|state| state.channel_id),
            new_channel: new.channel_id,
            listeners,
        };

        debug!(
            "Cambio de voz en guild {}: {:?} -> {:?} ({} oyentes)",
            guild_id, change.old_channel, change.new_channel, listeners
        );
        self.platform.route_voice_state(guild_id, change);
    }
}
