use serenity::{
    all::Timestamp,
    builder::{CreateEmbed, CreateEmbedFooter},
};
use std::time::Duration;

use crate::{library::Track, orchestrator::GuildQueueSnapshot};

/// Paleta de colores estandarizada para el bot
pub mod colors {
    use serenity::all::Colour;

    pub const SUCCESS_GREEN: Colour = Colour::from_rgb(67, 181, 129);
    pub const INFO_BLUE: Colour = Colour::from_rgb(52, 144, 220);
    pub const MUSIC_PURPLE: Colour = Colour::from_rgb(138, 43, 226);
    pub const NEUTRAL_GRAY: Colour = Colour::from_rgb(108, 117, 125);
}

/// Footer estandarizado para todos los embeds
const STANDARD_FOOTER: &str = "📻 Guild Radio";

const ITEMS_PER_PAGE: usize = 10;

/// Embed de la pista (o secuencia) actual con progreso
pub fn create_now_playing_embed(snapshot: &GuildQueueSnapshot) -> Option<CreateEmbed> {
    let run = snapshot.current_track.as_ref()?;
    let first = run.first()?;

    let mut embed = CreateEmbed::default()
        .title("🎵 Reproduciendo Ahora")
        .description(format!("**{}**", first.name))
        .color(colors::SUCCESS_GREEN)
        .field(
            "🎤 Artista",
            first
                .artist
                .as_deref()
                .or(first.album_artist.as_deref())
                .unwrap_or("Desconocido"),
            true,
        );

    if let Some(album) = &first.album {
        embed = embed.field("💿 Álbum", album, true);
    }

    let progress = match (snapshot.elapsed(), snapshot.current_total_duration) {
        (Some(elapsed), Some(total)) => {
            format!("{} / {}", format_duration(elapsed.min(total)), format_duration(total))
        }
        (Some(elapsed), None) => format_duration(elapsed),
        _ => "—".to_string(),
    };
    embed = embed.field("⏱️ Progreso", progress, true);

    if run.len() > 1 {
        let movements: String = run
            .iter()
            .enumerate()
            .map(|(i, track)| format!("`{}.` {}\n", i + 1, track.name))
            .collect();
        embed = embed.field(format!("🎼 Secuencia ({} partes)", run.len()), movements, false);
    }

    Some(
        embed
            .timestamp(Timestamp::now())
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER)),
    )
}

/// Crea un embed para mostrar la cola de reproducción
pub fn create_queue_embed(snapshot: &GuildQueueSnapshot, page: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("📋 Cola de Reproducción")
        .color(colors::INFO_BLUE);

    if let Some(first) = snapshot.current_track.as_ref().and_then(|run| run.first()) {
        let remaining = snapshot
            .remaining()
            .map(|r| format!(" (quedan {})", format_duration(r)))
            .unwrap_or_default();
        embed = embed.field(
            "▶️ Reproduciendo",
            format!("**{}**{}", first.display_title(), remaining),
            false,
        );
    }

    if snapshot.request_queue.is_empty() {
        return embed
            .description("😴 **La cola está vacía**\n\n💡 Se elegirá una pista al azar de la biblioteca")
            .color(colors::NEUTRAL_GRAY)
            .footer(CreateEmbedFooter::new(STANDARD_FOOTER))
            .timestamp(Timestamp::now());
    }

    let total_pages = snapshot.request_queue.len().div_ceil(ITEMS_PER_PAGE);
    let page = page.clamp(1, total_pages);
    let start = (page - 1) * ITEMS_PER_PAGE;

    let listing: String = snapshot
        .request_queue
        .iter()
        .enumerate()
        .skip(start)
        .take(ITEMS_PER_PAGE)
        .map(|(i, track)| format!("`{}.` {}\n", i + 1, track.display_title()))
        .collect();

    embed = embed.field(
        format!("🎶 Próximas ({})", snapshot.request_queue.len()),
        listing,
        false,
    );

    if let Some(total) = queue_duration(&snapshot.request_queue) {
        embed = embed.field(
            "⏳ Duración total",
            humantime::format_duration(total).to_string(),
            true,
        );
    }

    embed
        .footer(CreateEmbedFooter::new(format!(
            "Página {}/{} • {}",
            page, total_pages, STANDARD_FOOTER
        )))
        .timestamp(Timestamp::now())
}

/// Embed de confirmación al encolar
pub fn create_track_added_embed(track: &Track, position: usize) -> CreateEmbed {
    let mut embed = CreateEmbed::default()
        .title("✅ Pista Agregada")
        .description(format!("**{}** se agregó a la cola", track.display_title()))
        .color(colors::MUSIC_PURPLE)
        .field("📍 Posición", position.to_string(), true);

    if let Some(duration) = track.library_duration() {
        embed = embed.field("⏱️ Duración", format_duration(duration), true);
    }

    embed.footer(CreateEmbedFooter::new(STANDARD_FOOTER))
}

/// Duración de toda la cola, solo si se conocen todas
fn queue_duration(queue: &[Track]) -> Option<Duration> {
    queue.iter().map(Track::library_duration).sum()
}

fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
