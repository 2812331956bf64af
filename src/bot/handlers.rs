use anyhow::Result;
use serenity::{
    builder::{
        CreateEmbed, CreateInteractionResponse, CreateInteractionResponseMessage,
        EditInteractionResponse,
    },
    model::{
        application::CommandInteraction,
        id::{ChannelId, GuildId, UserId},
    },
    prelude::Context,
};
use tracing::{info, warn};

use crate::{
    bot::RadioBot,
    error::OrchestratorError,
    library::TrackLibrary,
    ui::embeds,
};

/// Maneja comandos slash
pub async fn handle_command(ctx: &Context, command: CommandInteraction, bot: &RadioBot) -> Result<()> {
    let guild_id = command
        .guild_id
        .ok_or_else(|| anyhow::anyhow!("Comando usado fuera de un servidor"))?;

    info!(
        "📝 Comando /{} usado por {} en guild {}",
        command.data.name, command.user.name, guild_id
    );

    match command.data.name.as_str() {
        "join" => handle_join(ctx, &command, bot, guild_id).await?,
        "leave" => handle_leave(ctx, &command, bot, guild_id).await?,
        "play" => handle_play(ctx, &command, bot, guild_id).await?,
        "skip" => handle_skip(ctx, &command, bot, guild_id).await?,
        "queue" => handle_queue(ctx, &command, bot, guild_id).await?,
        "nowplaying" => handle_nowplaying(ctx, &command, bot, guild_id).await?,
        "remove" => handle_remove(ctx, &command, bot, guild_id).await?,
        "clear" => handle_clear(ctx, &command, bot, guild_id).await?,
        "reload" => handle_reload(ctx, &command, bot).await?,
        _ => respond(ctx, &command, "❌ Comando no reconocido", true).await?,
    }

    Ok(())
}

async fn handle_join(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let Some(channel_id) = user_voice_channel(ctx, guild_id, command.user.id) else {
        return respond(ctx, command, "❌ Debes estar en un canal de voz", true).await;
    };

    // Conectar puede tardar
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let bot_user_id = ctx.cache.current_user().id;
    let content = match bot
        .orchestrator
        .join(guild_id, channel_id, bot_user_id, Vec::new())
        .await
    {
        Ok(()) => format!("🔊 Radio conectada a <#{}>", channel_id),
        Err(e) => error_message(&e),
    };

    command
        .edit_response(&ctx.http, EditInteractionResponse::new().content(content))
        .await?;

    Ok(())
}

async fn handle_leave(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.orchestrator.leave(guild_id) {
        Ok(()) => respond(ctx, command, "👋 Desconectando del canal de voz", false).await,
        Err(e) => respond(ctx, command, &error_message(&e), true).await,
    }
}

async fn handle_play(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let query = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "query")
        .and_then(|opt| opt.value.as_str())
        .ok_or_else(|| anyhow::anyhow!("Query no proporcionado"))?;

    let Some(track) = bot.library.find(query, 1).into_iter().next() else {
        return respond(
            ctx,
            command,
            &format!("❌ No se encontró nada para `{}`", query),
            true,
        )
        .await;
    };

    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
        )
        .await?;

    let result = if bot.orchestrator.get_guild_state(guild_id).is_some() {
        bot.orchestrator.enqueue(guild_id, track.clone())
    } else {
        // Radio inactiva: la pista pedida entra con la sesión, antes del primer requestNext
        let Some(channel_id) = user_voice_channel(ctx, guild_id, command.user.id) else {
            command
                .edit_response(
                    &ctx.http,
                    EditInteractionResponse::new().content("❌ Debes estar en un canal de voz"),
                )
                .await?;
            return Ok(());
        };

        let bot_user_id = ctx.cache.current_user().id;
        match bot
            .orchestrator
            .join(guild_id, channel_id, bot_user_id, vec![track.clone()])
            .await
        {
            Ok(()) => Ok(1),
            // Otro comando conectó la radio mientras tanto
            Err(OrchestratorError::AlreadyActive(_)) => {
                bot.orchestrator.enqueue(guild_id, track.clone())
            }
            Err(e) => Err(e),
        }
    };

    let response = match result {
        Ok(position) => EditInteractionResponse::new()
            .embed(embeds::create_track_added_embed(&track, position)),
        Err(e) => EditInteractionResponse::new().content(error_message(&e)),
    };

    command.edit_response(&ctx.http, response).await?;
    Ok(())
}

async fn handle_skip(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.orchestrator.skip(guild_id) {
        Ok(()) => respond(ctx, command, "⏭️ Saltando pista", false).await,
        Err(e) => respond(ctx, command, &error_message(&e), true).await,
    }
}

async fn handle_queue(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let page = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "page")
        .and_then(|opt| opt.value.as_i64())
        .unwrap_or(1)
        .max(1) as usize;

    match bot.orchestrator.get_guild_state(guild_id) {
        Some(snapshot) => respond_embed(ctx, command, embeds::create_queue_embed(&snapshot, page)).await,
        None => respond(ctx, command, "❌ La radio no está conectada. Usa /join", true).await,
    }
}

async fn handle_nowplaying(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let embed = bot
        .orchestrator
        .get_guild_state(guild_id)
        .and_then(|snapshot| embeds::create_now_playing_embed(&snapshot));

    match embed {
        Some(embed) => respond_embed(ctx, command, embed).await,
        None => respond(ctx, command, "❌ No hay nada reproduciéndose actualmente", true).await,
    }
}

async fn handle_remove(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    let position = command
        .data
        .options
        .iter()
        .find(|opt| opt.name == "position")
        .and_then(|opt| opt.value.as_i64())
        .ok_or_else(|| anyhow::anyhow!("Posición no proporcionada"))?;

    // La posición visible empieza en 1
    let index = usize::try_from(position.saturating_sub(1)).unwrap_or(0);

    match bot.orchestrator.remove_from_queue(guild_id, index) {
        Ok(track) => {
            let content = format!("🗑️ Quitada de la cola: **{}**", track.display_title());
            respond(ctx, command, &content, false).await
        }
        Err(e) => respond(ctx, command, &error_message(&e), true).await,
    }
}

async fn handle_clear(
    ctx: &Context,
    command: &CommandInteraction,
    bot: &RadioBot,
    guild_id: GuildId,
) -> Result<()> {
    match bot.orchestrator.clear_queue(guild_id) {
        Ok(cleared) => {
            let content = format!("🧹 Cola limpiada ({} pistas)", cleared);
            respond(ctx, command, &content, false).await
        }
        Err(e) => respond(ctx, command, &error_message(&e), true).await,
    }
}

async fn handle_reload(ctx: &Context, command: &CommandInteraction, bot: &RadioBot) -> Result<()> {
    match bot.library.reload().await {
        Ok(count) => {
            let content = format!("🔄 Biblioteca recargada: {} pistas", count);
            respond(ctx, command, &content, true).await
        }
        Err(e) => {
            warn!("⚠️ No se pudo recargar la biblioteca: {:?}", e);
            respond(ctx, command, "❌ No se pudo recargar la biblioteca", true).await
        }
    }
}

// Funciones auxiliares

async fn respond(ctx: &Context, command: &CommandInteraction, content: &str, ephemeral: bool) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(
                CreateInteractionResponseMessage::new()
                    .content(content)
                    .ephemeral(ephemeral),
            ),
        )
        .await?;

    Ok(())
}

async fn respond_embed(ctx: &Context, command: &CommandInteraction, embed: CreateEmbed) -> Result<()> {
    command
        .create_response(
            &ctx.http,
            CreateInteractionResponse::Message(CreateInteractionResponseMessage::new().embed(embed)),
        )
        .await?;

    Ok(())
}

fn error_message(error: &OrchestratorError) -> String {
    match error {
        OrchestratorError::NoActiveGuild(_) => "❌ La radio no está conectada. Usa /join".to_string(),
        OrchestratorError::AlreadyActive(_) => "❌ La radio ya está conectada en este servidor".to_string(),
        OrchestratorError::QueueFull { max, .. } => format!("❌ La cola está llena (máximo {} pistas)", max),
        OrchestratorError::OutOfRange { .. } => "❌ Esa posición no existe en la cola".to_string(),
        OrchestratorError::ConnectFailed { reason, .. } => {
            format!("❌ No se pudo conectar al canal de voz: {}", reason)
        }
    }
}

/// Canal de voz actual del usuario según la caché
fn user_voice_channel(ctx: &Context, guild_id: GuildId, user_id: UserId) -> Option<ChannelId> {
    let guild = guild_id.to_guild_cached(&ctx.cache)?;
    guild
        .voice_states
        .get(&user_id)
        .and_then(|voice_state| voice_state.channel_id)
}
